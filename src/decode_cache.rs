// decode_cache.rs

use crate::decoder::{CharDecoder, Decoded, Encoding};
use crate::ring_buffer::RingBuffer;

/// Longest line (in chars) that a delimiter read can return.
pub const MAX_LINE: usize = 1024;

/// Chars evicted first since the last full reset, with the bytes they took.
#[derive(Debug, Clone, Copy)]
struct Overflow {
    bytes: usize,
    chars: [char; 2],
    len: usize,
}

/// Bounded decode-ahead window over the receive ring.
///
/// Bytes are decoded one at a time without consuming them from the ring, so
/// a delimiter search can look ahead and leave the data in place when the
/// delimiter is absent. Each cached char records how many bytes it took; the
/// second char of a pair records zero. When the window fills, the oldest
/// char is evicted and the very first eviction of the epoch is remembered so
/// the window can be rebuilt from the ring head later.
pub struct DecodeCache {
    chars: RingBuffer<char>,
    widths: RingBuffer<usize>,
    decoder: Box<dyn CharDecoder>,
    /// Offset into the byte ring of the next byte to decode.
    cursor: usize,
    /// Value of `cursor` when the last char completed.
    last_char: usize,
    overflow: Option<Overflow>,
    delimiter: Option<String>,
}

impl DecodeCache {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            // One slot is reserved so a pair always fits after an eviction
            chars: RingBuffer::new(MAX_LINE + 1),
            widths: RingBuffer::new(MAX_LINE + 1),
            decoder: encoding.new_decoder(),
            cursor: 0,
            last_char: 0,
            overflow: None,
            delimiter: None,
        }
    }

    /// Number of bytes from the ring head already fed to the decoder.
    pub fn scanned(&self) -> usize {
        self.cursor
    }

    /// Number of decoded chars waiting in the window.
    pub fn cached(&self) -> usize {
        self.chars.len()
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflow.is_some()
    }

    /// Decode bytes from `bytes` until one char (or pair) completes.
    ///
    /// # Returns
    /// `false` if every unconsumed byte has been scanned and no char
    /// completed. A partial sequence stays in the decoder.
    pub fn peek_char(&mut self, bytes: &RingBuffer<u8>) -> bool {
        if self.cursor >= bytes.len() {
            return false;
        }
        if self.chars.free() <= 1 {
            self.evict();
        }

        let mut decoded = Decoded::Pending;
        while decoded == Decoded::Pending && self.cursor < bytes.len() {
            decoded = self.decoder.push(bytes[self.cursor]);
            self.cursor += 1;
        }

        let width = self.cursor - self.last_char;
        match decoded {
            Decoded::Pending => return false,
            Decoded::One(c) => {
                self.chars.push(c);
                self.widths.push(width);
            }
            Decoded::Two(a, b) => {
                self.chars.append(&[a, b]);
                self.widths.append(&[width, 0]);
            }
        }
        self.last_char = self.cursor;
        true
    }

    fn evict(&mut self) {
        let count = if self.widths.len() > 1 && self.widths[1] == 0 {
            2
        } else {
            1
        };
        if self.overflow.is_none() {
            let mut chars = [self.chars[0]; 2];
            if count == 2 {
                chars[1] = self.chars[1];
            }
            self.overflow = Some(Overflow {
                bytes: self.widths[0],
                chars,
                len: count,
            });
        }
        self.chars.consume(count);
        self.widths.consume(count);
    }

    /// Discard the window and the decoder state.
    ///
    /// With `with_overflow`, the window restarts from the first char evicted
    /// in this epoch, and scanning resumes right after it.
    pub fn reset(&mut self, with_overflow: bool) {
        self.chars.reset();
        self.widths.reset();
        self.decoder.reset();
        self.cursor = 0;
        if with_overflow {
            if let Some(overflow) = self.overflow {
                self.chars.append(&overflow.chars[..overflow.len]);
                self.widths.push(overflow.bytes);
                if overflow.len == 2 {
                    self.widths.push(0);
                }
                self.cursor = overflow.bytes;
            }
        }
        self.last_char = self.cursor;
        self.overflow = None;
    }

    /// Remove `count` cached chars and the bytes they were decoded from.
    fn consume(&mut self, count: usize, bytes: &mut RingBuffer<u8>) {
        let width: usize = self.widths.iter().take(count).sum();
        self.cursor -= width;
        self.last_char -= width;
        self.chars.consume(count);
        self.widths.consume(count);
        bytes.consume(width);
    }

    fn read_to_match(&self, delimiter: &[char]) -> bool {
        let len = self.chars.len();
        if len < delimiter.len() {
            return false;
        }
        let offset = len - delimiter.len();
        delimiter
            .iter()
            .enumerate()
            .all(|(i, &c)| self.chars[offset + i] == c)
    }

    /// Decode up to `count` chars into `out`, consuming their bytes.
    ///
    /// # Returns
    /// Number of chars appended. Stops early when the ring holds no further
    /// complete char.
    pub fn read_chars(
        &mut self,
        bytes: &mut RingBuffer<u8>,
        out: &mut String,
        count: usize,
    ) -> usize {
        if self.is_overflowed() {
            self.reset(true);
        }

        let mut read = 0;
        while read < count {
            if self.chars.is_empty() && !self.peek_char(bytes) {
                break;
            }
            out.push(self.chars[0]);
            self.consume(1, bytes);
            read += 1;
        }
        read
    }

    pub fn read_char(&mut self, bytes: &mut RingBuffer<u8>) -> Option<char> {
        let mut s = String::new();
        match self.read_chars(bytes, &mut s, 1) {
            0 => None,
            _ => s.chars().next(),
        }
    }

    /// Every char that can be decoded from the ring. A trailing incomplete
    /// sequence is left in the ring.
    pub fn read_existing(&mut self, bytes: &mut RingBuffer<u8>) -> String {
        let mut s = String::new();
        self.read_chars(bytes, &mut s, usize::MAX);
        s
    }

    /// Search for `delimiter` and return the text before it.
    ///
    /// On success the line and the delimiter are consumed from the ring. On
    /// failure nothing is consumed and the scan position is kept, so the next
    /// call continues where this one stopped.
    pub fn read_to(&mut self, bytes: &mut RingBuffer<u8>, delimiter: &str) -> Option<String> {
        if delimiter.is_empty() {
            return None;
        }
        let pattern: Vec<char> = delimiter.chars().collect();

        if self.delimiter.as_deref() != Some(delimiter) {
            self.delimiter = Some(delimiter.to_owned());
            if self.is_overflowed() {
                self.reset(true);
            }

            if self.chars.len() >= pattern.len() {
                let cached: String = self.chars.iter().collect();
                if let Some(p) = cached.find(delimiter) {
                    let line = cached[..p].to_owned();
                    let count = line.chars().count() + pattern.len();
                    self.consume(count, bytes);
                    // The chars left behind were never tail-checked, so the
                    // next call must search them again.
                    self.delimiter = None;
                    return Some(line);
                }
            }
        }

        while !self.read_to_match(&pattern) {
            if !self.peek_char(bytes) {
                return None;
            }
        }

        bytes.consume(self.cursor);
        let line = self
            .chars
            .iter()
            .take(self.chars.len() - pattern.len())
            .collect();
        self.reset(false);
        Some(line)
    }
}

impl std::fmt::Debug for DecodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeCache")
            .field("cached", &self.cached())
            .field("cursor", &self.cursor)
            .field("pending", &self.decoder.is_pending())
            .field("last_char", &self.last_char)
            .field("overflow", &self.overflow)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with(data: &[u8]) -> RingBuffer<u8> {
        let mut ring = RingBuffer::new(4096);
        assert_eq!(ring.append(data), data.len());
        ring
    }

    fn alphabet(len: usize) -> Vec<u8> {
        (0..len).map(|i| b'A' + (i % 26) as u8).collect()
    }

    #[test]
    fn test_read_char_then_raw_byte() {
        let mut bytes = ring_with(&[0x61, 0xE2, 0x82, 0xAC, 0x40, 0x41]);
        let mut cache = DecodeCache::new(Encoding::Utf8);

        assert_eq!(cache.read_char(&mut bytes), Some('a'));

        // A raw byte read takes the lead byte of the euro sign away
        assert_eq!(bytes.pop(), Some(0xE2));
        cache.reset(false);

        assert_eq!(cache.read_char(&mut bytes), Some('\u{FFFD}'));
        assert_eq!(cache.read_char(&mut bytes), Some('\u{FFFD}'));
        assert_eq!(cache.read_char(&mut bytes), Some('@'));
        assert_eq!(cache.read_char(&mut bytes), Some('A'));
        assert_eq!(cache.read_char(&mut bytes), None);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_multibyte_arriving_byte_by_byte() {
        let mut bytes = RingBuffer::new(16);
        let mut cache = DecodeCache::new(Encoding::Utf8);

        bytes.push(0xE2);
        assert_eq!(cache.read_char(&mut bytes), None);
        bytes.push(0x82);
        assert_eq!(cache.read_char(&mut bytes), None);
        assert_eq!(cache.scanned(), 2);
        assert!(format!("{:?}", cache).contains("pending: true"));
        bytes.push(0xAC);
        assert_eq!(cache.read_char(&mut bytes), Some('€'));
        assert!(bytes.is_empty());
        assert_eq!(cache.scanned(), 0);
    }

    #[test]
    fn test_read_line_without_delimiter_then_read_char() {
        let mut bytes = ring_with(&alphabet(2048));
        let mut cache = DecodeCache::new(Encoding::Utf8);

        assert_eq!(cache.read_to(&mut bytes, "\n"), None);
        assert!(cache.is_overflowed());
        assert_eq!(bytes.len(), 2048);

        assert_eq!(cache.read_char(&mut bytes), Some('A'));
        assert_eq!(cache.read_char(&mut bytes), Some('B'));
        assert_eq!(bytes.len(), 2046);
    }

    #[test]
    fn test_read_line_longer_than_window() {
        let mut data = alphabet(2047);
        data.push(b'\n');
        let mut bytes = ring_with(&data);
        let mut cache = DecodeCache::new(Encoding::Utf8);

        let line = cache.read_to(&mut bytes, "\n").unwrap();
        assert_eq!(line.len(), MAX_LINE - 1);
        assert!(line.starts_with('K'));
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_read_to_multichar_delimiter() {
        let mut data = alphabet(2048);
        data.extend_from_slice(b"eof");
        let mut bytes = ring_with(&data);
        let mut cache = DecodeCache::new(Encoding::Utf8);

        let line = cache.read_to(&mut bytes, "eof").unwrap();
        assert_eq!(line.len(), 1021);
        assert_eq!(line.as_bytes(), &data[2048 - 1021..2048]);
    }

    #[test]
    fn test_read_to_resumes_after_more_data() {
        let mut bytes = RingBuffer::new(64);
        let mut cache = DecodeCache::new(Encoding::Utf8);

        bytes.append("héllo wo".as_bytes());
        assert_eq!(cache.read_to(&mut bytes, "\r\n"), None);
        assert_eq!(cache.cached(), 8);

        bytes.append(b"rld\r\nnext");
        assert_eq!(cache.read_to(&mut bytes, "\r\n").as_deref(), Some("héllo world"));
        assert_eq!(cache.read_existing(&mut bytes), "next");
    }

    #[test]
    fn test_changed_delimiter_searches_cache() {
        let mut bytes = ring_with(b"one,two;three");
        let mut cache = DecodeCache::new(Encoding::Utf8);

        assert_eq!(cache.read_to(&mut bytes, "\n"), None);
        assert_eq!(cache.read_to(&mut bytes, ";").as_deref(), Some("one,two"));
        assert_eq!(cache.read_to(&mut bytes, ","), None);
        assert_eq!(cache.read_existing(&mut bytes), "three");
    }

    #[test]
    fn test_changed_delimiter_found_in_cache_keeps_rest() {
        let mut bytes = ring_with(b"ab;cd;ef");
        let mut cache = DecodeCache::new(Encoding::Utf8);

        assert_eq!(cache.read_to(&mut bytes, "\n"), None);
        assert_eq!(cache.read_to(&mut bytes, ";").as_deref(), Some("ab"));
        assert_eq!(bytes.len(), 5);
        assert_eq!(cache.read_to(&mut bytes, ";").as_deref(), Some("cd"));
        assert_eq!(bytes.len(), 2);
    }

    #[test]
    fn test_invalid_sequence_pair_in_line() {
        let mut bytes = ring_with(&[b'x', 0xE2, b'y', b'\n']);
        let mut cache = DecodeCache::new(Encoding::Utf8);

        assert_eq!(cache.read_to(&mut bytes, "\n").as_deref(), Some("x\u{FFFD}y"));
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_pair_consumed_with_first_char() {
        let mut bytes = ring_with(&[0xC3, b'z']);
        let mut cache = DecodeCache::new(Encoding::Utf8);

        assert_eq!(cache.read_char(&mut bytes), Some('\u{FFFD}'));
        // The pair's bytes belong to its first char
        assert!(bytes.is_empty());
        assert_eq!(cache.read_char(&mut bytes), Some('z'));
    }

    #[test]
    fn test_empty_delimiter() {
        let mut bytes = ring_with(b"abc");
        let mut cache = DecodeCache::new(Encoding::Utf8);
        assert_eq!(cache.read_to(&mut bytes, ""), None);
        assert_eq!(bytes.len(), 3);
    }

    #[test]
    fn test_latin1_read_existing() {
        let mut bytes = ring_with(&[b'c', 0xE9, 0xE2]);
        let mut cache = DecodeCache::new(Encoding::Latin1);
        assert_eq!(cache.read_existing(&mut bytes), "cé\u{E2}");
    }

    #[test]
    fn test_read_existing_leaves_partial_sequence() {
        let mut bytes = ring_with(&[b'o', b'k', 0xE2, 0x82]);
        let mut cache = DecodeCache::new(Encoding::Utf8);

        assert_eq!(cache.read_existing(&mut bytes), "ok");
        assert_eq!(bytes.len(), 2);
        bytes.push(0xAC);
        assert_eq!(cache.read_existing(&mut bytes), "€");
    }
}
