use std::ptr;
use std::sync::atomic::{fence, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const MAX_AUTHOR_SIZE: usize = 32;
pub const MAX_TEXT_SIZE: usize = 256;

/// A chat message as seen by the processes that attach to the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRecord {
    pub author: String,
    pub text: String,
    pub timestamp: SystemTime,
}

impl MessageRecord {
    pub fn new(author: &str, text: &str, timestamp: SystemTime) -> MessageRecord {
        MessageRecord {
            author: truncate(author, MAX_AUTHOR_SIZE).to_string(),
            text: truncate(text, MAX_TEXT_SIZE).to_string(),
            timestamp,
        }
    }
}

/// Fixed-size slot as it is laid out in the shared segment.
///
/// All strings are stored as raw bytes with an explicit length so a slot never
/// depends on NUL termination. A zeroed slot is an inactive, empty record.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Slot {
    pub timestamp_secs: u64,
    pub timestamp_nanos: u32,
    pub text_len: u16,
    pub author_len: u8,
    pub active: u8,
    pub author: [u8; MAX_AUTHOR_SIZE],
    pub text: [u8; MAX_TEXT_SIZE],
}

impl Default for Slot {
    fn default() -> Slot {
        Slot {
            timestamp_secs: 0,
            timestamp_nanos: 0,
            text_len: 0,
            author_len: 0,
            active: 0,
            author: [0u8; MAX_AUTHOR_SIZE],
            text: [0u8; MAX_TEXT_SIZE],
        }
    }
}

impl Slot {
    pub fn encode(record: &MessageRecord) -> Slot {
        let mut slot = Slot::unpublished(record);
        slot.active = 1;
        slot
    }

    /// Encodes `record` into an inactive slot.
    fn unpublished(record: &MessageRecord) -> Slot {
        let mut slot = Slot::default();
        let author = truncate(&record.author, MAX_AUTHOR_SIZE).as_bytes();
        let text = truncate(&record.text, MAX_TEXT_SIZE).as_bytes();
        slot.author[..author.len()].copy_from_slice(author);
        slot.author_len = author.len() as u8;
        slot.text[..text.len()].copy_from_slice(text);
        slot.text_len = text.len() as u16;

        // Times before the epoch are clamped to it.
        let since_epoch = record
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        slot.timestamp_secs = since_epoch.as_secs();
        slot.timestamp_nanos = since_epoch.subsec_nanos();
        slot
    }

    /// Marks the slot inactive before any of its bytes change. A process killed
    /// while overwriting leaves an inactive slot behind, never a mixed record.
    pub(crate) fn retire(&mut self) {
        unsafe { ptr::write_volatile(&mut self.active, 0) };
        fence(Ordering::SeqCst);
    }

    /// Copies `record` into a retired slot without activating it.
    pub(crate) fn fill(&mut self, record: &MessageRecord) {
        *self = Slot::unpublished(record);
        fence(Ordering::SeqCst);
    }

    /// Makes a filled slot visible to readers.
    pub(crate) fn publish(&mut self) {
        fence(Ordering::SeqCst);
        unsafe { ptr::write_volatile(&mut self.active, 1) };
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active != 0
    }

    /// Returns `None` for inactive slots. Lengths read from shared memory are
    /// clamped to the slot bounds, so a corrupted slot decodes lossily instead of
    /// reading past its end.
    pub fn decode(&self) -> Option<MessageRecord> {
        if !self.is_active() {
            return None;
        }
        let author_len = (self.author_len as usize).min(MAX_AUTHOR_SIZE);
        let text_len = (self.text_len as usize).min(MAX_TEXT_SIZE);
        let nanos = self.timestamp_nanos.min(999_999_999);
        Some(MessageRecord {
            author: String::from_utf8_lossy(&self.author[..author_len]).into_owned(),
            text: String::from_utf8_lossy(&self.text[..text_len]).into_owned(),
            timestamp: UNIX_EPOCH
                .checked_add(Duration::new(self.timestamp_secs, nanos))
                .unwrap_or(UNIX_EPOCH),
        })
    }
}

/// Cuts `s` to at most `max` bytes without splitting a UTF-8 character.
pub fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        // "é" is two bytes; cutting in its middle drops it entirely.
        assert_eq!(truncate("aé", 2), "a");
        assert_eq!(truncate("🥕🥕", 5), "🥕");
    }

    #[test]
    fn zeroed_slot_is_inactive() {
        assert!(Slot::default().decode().is_none());
    }

    #[test]
    fn encode_preserves_timestamp_precision() {
        let ts = UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
        let record = MessageRecord::new("alice", "hola", ts);
        let decoded = Slot::encode(&record).decode().unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.timestamp, ts);
    }

    #[test]
    fn long_text_is_bounded() {
        let text = "x".repeat(MAX_TEXT_SIZE + 40);
        let author = "y".repeat(MAX_AUTHOR_SIZE + 1);
        let record = MessageRecord::new(&author, &text, SystemTime::now());
        assert_eq!(record.text.len(), MAX_TEXT_SIZE);
        assert_eq!(record.author.len(), MAX_AUTHOR_SIZE);

        let decoded = Slot::encode(&record).decode().unwrap();
        assert_eq!(decoded.text.len(), MAX_TEXT_SIZE);
        assert_eq!(decoded.author.len(), MAX_AUTHOR_SIZE);
    }

    #[test]
    fn corrupted_lengths_are_clamped() {
        let mut slot = Slot::encode(&MessageRecord::new("bob", "hi", SystemTime::now()));
        slot.text_len = u16::MAX;
        slot.author_len = u8::MAX;
        let decoded = slot.decode().unwrap();
        assert_eq!(decoded.text.len(), MAX_TEXT_SIZE);
        assert_eq!(decoded.author.len(), MAX_AUTHOR_SIZE);
    }
}
