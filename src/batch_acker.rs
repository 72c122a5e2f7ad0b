//! Per-batch bitmap of individually-acked sub-messages, shared by every
//! `MessageId` exploded out of one received batch entry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bit_vec::BitVec;

/// Invariant: `popcount(bits) + acks_sent == size` always holds; the acker
/// is dropped (via the last `Arc` reference) once the final sub-index is
/// acked, so nothing needs an explicit teardown call.
pub struct BatchAcker {
    size: u32,
    bits: Mutex<BitVec>,
    acked_count: AtomicUsize,
    prev_batch_cumulatively_acked: AtomicUsize,
}

impl BatchAcker {
    pub fn new(size: u32) -> BatchAcker {
        BatchAcker {
            size,
            bits: Mutex::new(BitVec::from_elem(size as usize, false)),
            acked_count: AtomicUsize::new(0),
            prev_batch_cumulatively_acked: AtomicUsize::new(0),
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Marks `index` acked. Returns true the first time every index in the
    /// batch has been acked (i.e. this call completed the batch).
    pub fn ack_individual(&self, index: u32) -> bool {
        let mut bits = self.bits.lock().unwrap();
        if index as usize >= bits.len() {
            return false;
        }
        if !bits.get(index as usize).unwrap_or(false) {
            bits.set(index as usize, true);
            self.acked_count.fetch_add(1, Ordering::SeqCst);
        }
        self.acked_count.load(Ordering::SeqCst) == self.size as usize
    }

    /// Cumulative ack at `index`: marks every sub-index `0..=index` acked in
    /// one step. Returns true if this completes the batch.
    pub fn ack_cumulative(&self, index: u32) -> bool {
        let mut bits = self.bits.lock().unwrap();
        let mut newly = 0usize;
        for i in 0..=index as usize {
            if i < bits.len() && !bits.get(i).unwrap_or(true) {
                bits.set(i, true);
                newly += 1;
            }
        }
        if newly > 0 {
            self.acked_count.fetch_add(newly, Ordering::SeqCst);
        }
        self.acked_count.load(Ordering::SeqCst) == self.size as usize
    }

    pub fn all_acked(&self) -> bool {
        self.acked_count.load(Ordering::SeqCst) == self.size as usize
    }

    /// §4.9's cross-batch cumulative-ack bookkeeping: whether the *previous*
    /// batch's terminal cumulative ack has already been emitted for this one.
    pub fn prev_batch_cumulatively_acked(&self) -> bool {
        self.prev_batch_cumulatively_acked.load(Ordering::SeqCst) != 0
    }

    pub fn set_prev_batch_cumulatively_acked(&self) {
        self.prev_batch_cumulatively_acked.store(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_acked_only_after_every_index_seen() {
        let acker = BatchAcker::new(3);
        assert!(!acker.ack_individual(0));
        assert!(!acker.ack_individual(2));
        assert!(acker.ack_individual(1));
        assert!(acker.all_acked());
    }

    #[test]
    fn acking_the_same_index_twice_does_not_double_count() {
        let acker = BatchAcker::new(2);
        acker.ack_individual(0);
        acker.ack_individual(0);
        assert!(!acker.all_acked());
        assert!(acker.ack_individual(1));
    }

    #[test]
    fn cumulative_ack_covers_all_prior_indices() {
        let acker = BatchAcker::new(5);
        assert!(!acker.ack_cumulative(2));
        assert!(acker.ack_individual(3));
        assert!(acker.ack_individual(4));
    }
}
