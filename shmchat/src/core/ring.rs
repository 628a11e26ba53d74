//! Ring arithmetic over the shared slots.
//!
//! Sequence number `s` (0-based, counted from segment creation) lives in slot
//! `s % capacity`. Only the last `capacity` sequence numbers are retained; a
//! reader that fell further behind is fast-forwarded to the oldest retained one.

use super::record::{MessageRecord, Slot};

/// Counters at the head of the shared segment.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct Counters {
    pub total_written: u64,
    pub next_write_index: u64,
}

/// A record together with its global sequence number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sequenced {
    pub seq: u64,
    pub record: MessageRecord,
}

/// Result of a `read_since` scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadBatch {
    pub records: Vec<Sequenced>,
    /// `total_written` at the time of the scan; the next cursor value.
    pub observed: u64,
    /// Sequence numbers in `[cursor, observed - capacity)` that were already
    /// overwritten and therefore skipped.
    pub skipped: u64,
}

#[inline]
pub fn seq_to_index(seq: u64, capacity: u64) -> usize {
    (seq % capacity) as usize
}

/// Oldest sequence number that may still be read from a cursor position.
#[inline]
pub fn clamp_start(cursor: u64, total_written: u64, capacity: u64) -> u64 {
    cursor.max(total_written.saturating_sub(capacity))
}

/// Mutable view of the ring. Only constructed while the gate is held.
pub struct Ring<'a> {
    counters: &'a mut Counters,
    slots: &'a mut [Slot],
}

impl<'a> Ring<'a> {
    pub(crate) fn new(counters: &'a mut Counters, slots: &'a mut [Slot]) -> Ring<'a> {
        assert!(!slots.is_empty(), "ring needs at least one slot");
        Ring { counters, slots }
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    #[inline]
    pub fn total_written(&self) -> u64 {
        self.counters.total_written
    }

    /// Writes `record` over the oldest slot and returns the new `total_written`.
    ///
    /// The slot is retired before it is rewritten and only published after the
    /// counters moved, so a writer killed at any point leaves either a missing
    /// message or a complete one.
    pub fn append(&mut self, record: &MessageRecord) -> u64 {
        let index = seq_to_index(self.counters.next_write_index, self.capacity());
        self.slots[index].retire();
        self.slots[index].fill(record);
        self.counters.next_write_index += 1;
        self.counters.total_written += 1;
        self.slots[index].publish();
        self.counters.total_written
    }

    /// Returns every retained record with a sequence number at or after `cursor`,
    /// oldest first. At most `capacity` records are returned.
    pub fn read_since(&self, cursor: u64) -> ReadBatch {
        let total = self.counters.total_written;
        let capacity = self.capacity();
        let start = clamp_start(cursor, total, capacity);
        let records = (start..total)
            .filter_map(|seq| {
                self.slots[seq_to_index(seq, capacity)]
                    .decode()
                    .map(|record| Sequenced { seq, record })
            })
            .collect();
        ReadBatch {
            records,
            observed: total,
            skipped: start.saturating_sub(cursor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn record(n: u64) -> MessageRecord {
        MessageRecord::new(
            "alice",
            &format!("message {}", n),
            UNIX_EPOCH + Duration::from_secs(n),
        )
    }

    fn fill(ring: &mut Ring<'_>, count: u64) {
        for n in 0..count {
            ring.append(&record(n));
        }
    }

    #[test]
    fn append_counts_one_per_call() {
        let mut counters = Counters::default();
        let mut slots = vec![Slot::default(); 4];
        let mut ring = Ring::new(&mut counters, &mut slots);
        for n in 0..10 {
            assert_eq!(ring.append(&record(n)), n + 1);
        }
        assert_eq!(counters.total_written, 10);
        assert_eq!(counters.next_write_index, 10);
    }

    #[test]
    fn overflow_drops_only_the_oldest() {
        let capacity = 5;
        let mut counters = Counters::default();
        let mut slots = vec![Slot::default(); capacity];
        let mut ring = Ring::new(&mut counters, &mut slots);
        fill(&mut ring, capacity as u64 + 1);

        let batch = ring.read_since(0);
        assert_eq!(batch.records.len(), capacity);
        assert_eq!(batch.skipped, 1);
        assert_eq!(batch.observed, 6);
        assert!(batch.records.iter().all(|r| r.record.text != "message 0"));
        let seqs: Vec<u64> = batch.records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(batch.records[0].record.text, "message 1");
    }

    #[test]
    fn read_since_never_goes_below_retained_window() {
        let capacity = 8u64;
        let mut counters = Counters::default();
        let mut slots = vec![Slot::default(); capacity as usize];
        let mut ring = Ring::new(&mut counters, &mut slots);
        fill(&mut ring, 37);

        for cursor in 0..=37 {
            let batch = ring.read_since(cursor);
            let floor = cursor.max(37 - capacity);
            assert!(batch.records.len() as u64 <= capacity);
            assert!(batch.records.iter().all(|r| r.seq >= floor));
            assert_eq!(batch.records.len() as u64, 37 - floor);
            // Each returned record is the one written with that sequence number.
            for r in &batch.records {
                assert_eq!(r.record.text, format!("message {}", r.seq));
            }
        }
    }

    #[test]
    fn read_since_at_head_is_empty() {
        let mut counters = Counters::default();
        let mut slots = vec![Slot::default(); 3];
        let mut ring = Ring::new(&mut counters, &mut slots);
        fill(&mut ring, 2);
        let batch = ring.read_since(2);
        assert!(batch.records.is_empty());
        assert_eq!(batch.observed, 2);
        assert_eq!(batch.skipped, 0);
    }

    #[test]
    fn interrupted_overwrite_is_never_returned() {
        let mut counters = Counters::default();
        let mut slots = vec![Slot::default(); 4];
        let mut ring = Ring::new(&mut counters, &mut slots);
        fill(&mut ring, 4);

        // The fifth append dies after the author of slot 0 changed.
        let slot = &mut ring.slots[0];
        slot.retire();
        slot.author[..7].copy_from_slice(b"mallory");
        slot.author_len = 7;

        let batch = ring.read_since(0);
        let seqs: Vec<u64> = batch.records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(batch.records.iter().all(|r| r.record.author == "alice"));
        assert_eq!(batch.observed, 4);

        // The next writer reuses the slot and completes normally.
        assert_eq!(ring.append(&record(4)), 5);
        let batch = ring.read_since(0);
        let texts: Vec<&str> = batch.records.iter().map(|r| r.record.text.as_str()).collect();
        assert_eq!(texts, vec!["message 1", "message 2", "message 3", "message 4"]);
    }

    #[test]
    fn filled_but_unpublished_slot_stays_hidden() {
        let mut counters = Counters::default();
        let mut slots = vec![Slot::default(); 4];
        let mut ring = Ring::new(&mut counters, &mut slots);
        fill(&mut ring, 2);

        // Killed after the counters moved, before the slot was published.
        ring.slots[2].retire();
        ring.slots[2].fill(&record(2));
        ring.counters.next_write_index += 1;
        ring.counters.total_written += 1;

        let batch = ring.read_since(0);
        let seqs: Vec<u64> = batch.records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(batch.observed, 3);
    }

    #[test]
    fn clamp_start_values() {
        assert_eq!(clamp_start(0, 3, 50), 0);
        assert_eq!(clamp_start(0, 51, 50), 1);
        assert_eq!(clamp_start(40, 51, 50), 40);
        assert_eq!(clamp_start(10, 100, 50), 50);
    }
}
