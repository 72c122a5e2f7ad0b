//! Thin wrappers around the actual codec crates. The codecs themselves are
//! external collaborators (SPEC_FULL.md §1); this module only adapts their
//! APIs to `compress(kind, &[u8]) -> Vec<u8>` / `decompress(kind, &[u8], usize)`.

use crate::message::proto::CompressionType;

/// Compress `data` with `kind`. `CompressionType::None` is a no-op copy.
pub(crate) fn compress(kind: CompressionType, data: &[u8]) -> Vec<u8> {
    match kind {
        CompressionType::None => data.to_vec(),
        #[cfg(feature = "compression")]
        CompressionType::Lz4 => {
            use std::io::Write;
            let mut encoder = lz4::EncoderBuilder::new().build(Vec::new()).expect("lz4 encoder");
            encoder.write_all(data).expect("lz4 write");
            let (buf, result) = encoder.finish();
            result.expect("lz4 finish");
            buf
        }
        #[cfg(feature = "compression")]
        CompressionType::ZLib => {
            use flate2::{write::ZlibEncoder, Compression};
            use std::io::Write;
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).expect("zlib write");
            encoder.finish().expect("zlib finish")
        }
        #[cfg(feature = "compression")]
        CompressionType::ZStd => zstd::encode_all(data, 0).expect("zstd encode"),
        #[cfg(feature = "compression")]
        CompressionType::Snappy => {
            let mut encoder = snap::raw::Encoder::new();
            encoder.compress_vec(data).expect("snappy compress")
        }
        #[cfg(not(feature = "compression"))]
        _ => panic!("the `compression` cargo feature is not active"),
    }
}

/// Decompress `data`, which is expected to expand to exactly
/// `uncompressed_size` bytes (`MessageMetadata.uncompressed_size`).
pub(crate) fn decompress(
    kind: CompressionType,
    data: &[u8],
    uncompressed_size: usize,
) -> Result<Vec<u8>, crate::error::ConnectionError> {
    let err = |e: String| crate::error::ConnectionError::Unexpected(format!("decompression failed: {}", e));
    match kind {
        CompressionType::None => Ok(data.to_vec()),
        #[cfg(feature = "compression")]
        CompressionType::Lz4 => {
            use std::io::Read;
            let mut decoder = lz4::Decoder::new(data).map_err(|e| err(e.to_string()))?;
            let mut out = Vec::with_capacity(uncompressed_size);
            decoder.read_to_end(&mut out).map_err(|e| err(e.to_string()))?;
            Ok(out)
        }
        #[cfg(feature = "compression")]
        CompressionType::ZLib => {
            use flate2::read::ZlibDecoder;
            use std::io::Read;
            let mut decoder = ZlibDecoder::new(data);
            let mut out = Vec::with_capacity(uncompressed_size);
            decoder.read_to_end(&mut out).map_err(|e| err(e.to_string()))?;
            Ok(out)
        }
        #[cfg(feature = "compression")]
        CompressionType::ZStd => zstd::decode_all(data).map_err(|e| err(e.to_string())),
        #[cfg(feature = "compression")]
        CompressionType::Snappy => {
            let mut decoder = snap::raw::Decoder::new();
            decoder.decompress_vec(data).map_err(|e| err(e.to_string()))
        }
        #[cfg(not(feature = "compression"))]
        _ => Err(err("the `compression` cargo feature is not active".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_round_trips_identity() {
        let data = b"hello world";
        let compressed = compress(CompressionType::None, data);
        let decompressed = decompress(CompressionType::None, &compressed, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }

    #[cfg(feature = "compression")]
    #[test]
    fn lz4_round_trips() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(4);
        let compressed = compress(CompressionType::Lz4, &data);
        let decompressed = decompress(CompressionType::Lz4, &compressed, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }

    #[cfg(feature = "compression")]
    #[test]
    fn zstd_round_trips() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(4);
        let compressed = compress(CompressionType::ZStd, &data);
        let decompressed = decompress(CompressionType::ZStd, &compressed, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }
}
