//! The sliding-window "k-buffer": the circular array of outstanding,
//! unacknowledged I-frames a connection has sent, grounded on
//! `original_source`'s `MasterConnection.sentASDUs` array and
//! `checkSequenceNumber`.

use std::collections::VecDeque;

use crate::queue::EntryRef;

const SEQ_MODULUS: u32 = 32768;

#[derive(Debug, Clone, Copy)]
pub struct KEntry {
    pub seq_no: u16,
    pub sent_time_ms: u64,
    pub queue_entry_ref: Option<EntryRef>,
    pub entry_time_ms: u64,
}

#[derive(Debug)]
pub struct KBuffer {
    capacity: u16,
    entries: VecDeque<KEntry>,
}

fn wrapping_distance(from: u16, to: u16) -> u32 {
    (((to as u32) + SEQ_MODULUS) - (from as u32)) % SEQ_MODULUS
}

impl KBuffer {
    pub fn new(capacity: u16) -> Self {
        KBuffer {
            capacity,
            entries: VecDeque::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() as u16 >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn push(&mut self, entry: KEntry) {
        debug_assert!(!self.is_full());
        self.entries.push_back(entry);
    }

    pub fn oldest(&self) -> Option<&KEntry> {
        self.entries.front()
    }

    pub fn newest(&self) -> Option<&KEntry> {
        self.entries.back()
    }

    /// Validates an incoming receive-sequence-number acknowledgement and, if
    /// valid, removes every entry with `seq_no` at or before `n` (respecting
    /// 15-bit wraparound), returning the removed entries so the caller can
    /// confirm their queue entries.
    ///
    /// `n` follows the same convention as a TCP receive-sequence ack: it
    /// names the sequence number of the next I-frame the peer expects, so
    /// it confirms every outstanding entry whose `seq_no` comes strictly
    /// before it. Mirrors `checkSequenceNumber`: an empty buffer only
    /// accepts `n` equal to the sender's own next sequence number; a
    /// non-empty buffer accepts any `n` in `[oldest, newest+1]`, plus
    /// `oldest - 1` (restating a previous ack with nothing new confirmed).
    pub fn check_and_confirm(&mut self, n: u16, send_count: u16) -> Option<Vec<KEntry>> {
        if self.entries.is_empty() {
            return if n == send_count { Some(Vec::new()) } else { None };
        }

        let oldest = self.entries.front().unwrap().seq_no;
        let newest = self.entries.back().unwrap().seq_no;

        let just_before_oldest = ((oldest as u32 + SEQ_MODULUS - 1) % SEQ_MODULUS) as u16;
        if n == just_before_oldest {
            return Some(Vec::new());
        }

        let dist_to_n = wrapping_distance(oldest, n);
        let outstanding_span = wrapping_distance(oldest, newest) + 1;
        if dist_to_n > outstanding_span {
            return None;
        }

        let mut removed = Vec::new();
        while let Some(front) = self.entries.front() {
            let confirmed = wrapping_distance(oldest, front.seq_no) < dist_to_n;
            if confirmed {
                removed.push(self.entries.pop_front().unwrap());
            } else {
                break;
            }
        }
        Some(removed)
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: u16) -> KEntry {
        KEntry {
            seq_no: seq,
            sent_time_ms: 0,
            queue_entry_ref: None,
            entry_time_ms: 0,
        }
    }

    #[test]
    fn empty_buffer_accepts_only_current_send_count() {
        let mut k = KBuffer::new(4);
        assert!(k.check_and_confirm(0, 0).is_some());
        assert!(k.check_and_confirm(1, 0).is_none());
    }

    #[test]
    fn confirms_and_removes_entries_before_n() {
        let mut k = KBuffer::new(4);
        k.push(entry(0));
        k.push(entry(1));
        k.push(entry(2));
        // n=2 confirms every entry with seq_no < 2: seq 0 and seq 1.
        let removed = k.check_and_confirm(2, 3).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(k.len(), 1);
        assert_eq!(k.oldest().unwrap().seq_no, 2);
    }

    #[test]
    fn rejects_out_of_window_sequence_number() {
        let mut k = KBuffer::new(4);
        k.push(entry(5));
        k.push(entry(6));
        assert!(k.check_and_confirm(10, 7).is_none());
    }

    #[test]
    fn handles_wraparound_near_32768() {
        let mut k = KBuffer::new(4);
        k.push(entry(32766));
        k.push(entry(32767));
        k.push(entry(0));
        // n=0 confirms seq 32766 and seq 32767, leaving the wrapped seq 0 entry.
        let removed = k.check_and_confirm(0, 1).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(k.oldest().unwrap().seq_no, 0);
    }

    #[test]
    fn full_buffer_reports_full() {
        let mut k = KBuffer::new(2);
        k.push(entry(0));
        assert!(!k.is_full());
        k.push(entry(1));
        assert!(k.is_full());
    }
}
