//! streaming utf-8 validation
//!
//! text messages may be split across frames at arbitrary byte positions, so
//! a partial multi-byte sequence at the end of one chunk must be carried
//! into the next

use utf8::{DecodeError, Incomplete};

/// validator that accepts text payload chunks as they arrive
#[derive(Debug)]
pub(crate) struct Utf8Validator {
    incomplete: Incomplete,
}

impl Default for Utf8Validator {
    fn default() -> Self {
        Self {
            incomplete: Incomplete::empty(),
        }
    }
}

impl Utf8Validator {
    /// feed the next chunk, `false` means the stream can never become
    /// valid utf-8
    pub fn feed(&mut self, mut input: &[u8]) -> bool {
        if !self.incomplete.is_empty() {
            match self.incomplete.try_complete(input) {
                // chunk exhausted inside the pending sequence
                None => return true,
                Some((Ok(_), rest)) => input = rest,
                Some((Err(_), _)) => return false,
            }
        }
        match utf8::decode(input) {
            Ok(_) => true,
            Err(DecodeError::Incomplete {
                incomplete_suffix, ..
            }) => {
                self.incomplete = incomplete_suffix;
                true
            }
            Err(DecodeError::Invalid { .. }) => false,
        }
    }

    /// the message ended, any dangling sequence makes it invalid
    pub fn finish(&mut self) -> bool {
        let complete = self.incomplete.is_empty();
        self.incomplete = Incomplete::empty();
        complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ascii() {
        let mut v = Utf8Validator::default();
        assert!(v.feed(b"hello"));
        assert!(v.finish());
    }

    #[test]
    fn multibyte_split_across_chunks() {
        // U+1F30D EARTH GLOBE, four utf-8 bytes fed one at a time
        let globe = "\u{1F30D}".as_bytes();
        let mut v = Utf8Validator::default();
        for b in globe {
            assert!(v.feed(std::slice::from_ref(b)));
        }
        assert!(v.finish());
    }

    #[test]
    fn invalid_sequence_rejected() {
        let mut v = Utf8Validator::default();
        assert!(!v.feed(&[0xC3, 0x28]));
    }

    #[test]
    fn dangling_sequence_rejected_at_finish() {
        let mut v = Utf8Validator::default();
        assert!(v.feed(&[0xC3]));
        assert!(!v.finish());
    }

    #[test]
    fn continuation_byte_completing_pending_sequence() {
        let mut v = Utf8Validator::default();
        assert!(v.feed(&[0xC3]));
        assert!(v.feed(&[0xA9, b'!']));
        assert!(v.finish());
    }

    #[test]
    fn invalid_continuation_of_pending_sequence() {
        let mut v = Utf8Validator::default();
        assert!(v.feed(&[0xE2, 0x82]));
        assert!(!v.feed(&[0x28]));
    }
}
