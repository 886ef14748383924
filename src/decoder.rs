// decoder.rs

use std::borrow::Cow;

pub const REPLACEMENT: char = char::REPLACEMENT_CHARACTER;

/// Result of feeding one byte to a [`CharDecoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// The byte was absorbed into an incomplete sequence.
    Pending,
    One(char),
    /// The byte completed two chars at once, which must be stored together.
    Two(char, char),
}

/// Incremental byte-to-char decoder.
///
/// Bytes arrive one at a time and may split a multi-byte sequence at any
/// point. At most one incomplete sequence is held.
pub trait CharDecoder: Send {
    fn push(&mut self, byte: u8) -> Decoded;

    /// Drop any pending partial sequence.
    fn reset(&mut self);

    fn is_pending(&self) -> bool;
}

/// UTF-8 decoder that replaces malformed input with U+FFFD.
///
/// A byte that cannot continue the pending sequence ends that sequence with a
/// replacement char and is then decoded afresh. When the fresh decode yields
/// a char straight away (ASCII, or a stray byte), both chars come out of the
/// same step.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    code: u32,
    needed: u8,
    lower: u8,
    upper: u8,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin decoding at `byte`. Returns a char if the byte stands alone.
    fn start(&mut self, byte: u8) -> Option<char> {
        self.lower = 0x80;
        self.upper = 0xBF;
        let (needed, bits) = match byte {
            0x00..=0x7F => return Some(char::from(byte)),
            0xC2..=0xDF => (1, byte & 0x1F),
            0xE0 => {
                self.lower = 0xA0;
                (2, byte & 0x0F)
            }
            0xE1..=0xEC | 0xEE..=0xEF => (2, byte & 0x0F),
            0xED => {
                self.upper = 0x9F;
                (2, byte & 0x0F)
            }
            0xF0 => {
                self.lower = 0x90;
                (3, byte & 0x07)
            }
            0xF1..=0xF3 => (3, byte & 0x07),
            0xF4 => {
                self.upper = 0x8F;
                (3, byte & 0x07)
            }
            _ => return Some(REPLACEMENT),
        };
        self.needed = needed;
        self.code = u32::from(bits);
        None
    }

    fn clear(&mut self) {
        self.code = 0;
        self.needed = 0;
    }
}

impl CharDecoder for Utf8Decoder {
    fn push(&mut self, byte: u8) -> Decoded {
        if self.needed == 0 {
            return match self.start(byte) {
                Some(c) => Decoded::One(c),
                None => Decoded::Pending,
            };
        }

        if byte < self.lower || byte > self.upper {
            self.clear();
            return match self.start(byte) {
                Some(c) => Decoded::Two(REPLACEMENT, c),
                None => Decoded::One(REPLACEMENT),
            };
        }

        self.lower = 0x80;
        self.upper = 0xBF;
        self.code = (self.code << 6) | u32::from(byte & 0x3F);
        self.needed -= 1;
        if self.needed > 0 {
            return Decoded::Pending;
        }

        let c = char::from_u32(self.code).unwrap_or(REPLACEMENT);
        self.clear();
        Decoded::One(c)
    }

    fn reset(&mut self) {
        self.clear();
    }

    fn is_pending(&self) -> bool {
        self.needed > 0
    }
}

/// ISO-8859-1: every byte is exactly one char.
#[derive(Debug, Default)]
pub struct Latin1Decoder;

impl CharDecoder for Latin1Decoder {
    fn push(&mut self, byte: u8) -> Decoded {
        Decoded::One(char::from(byte))
    }

    fn reset(&mut self) {}

    fn is_pending(&self) -> bool {
        false
    }
}

/// Character encoding used for decoded reads and string writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Utf8,
    Latin1,
}

impl Encoding {
    pub fn new_decoder(self) -> Box<dyn CharDecoder> {
        match self {
            Encoding::Utf8 => Box::new(Utf8Decoder::new()),
            Encoding::Latin1 => Box::new(Latin1Decoder),
        }
    }

    /// Encode `s` for transmission. Chars outside Latin-1 become `?`.
    pub fn encode(self, s: &str) -> Cow<'_, [u8]> {
        match self {
            Encoding::Utf8 => Cow::Borrowed(s.as_bytes()),
            Encoding::Latin1 => Cow::Owned(
                s.chars()
                    .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                    .collect(),
            ),
        }
    }
}
