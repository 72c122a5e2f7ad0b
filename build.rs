fn main() {
    prost_build::compile_protos(&["proto/PulsarApi.proto"], &["proto/"]).unwrap();
}
