//! Sentence framing for the RouterOS API protocol.
//!
//! A sentence is a run of words terminated by a zero-length word. Each word
//! carries a variable-length prefix: lengths below 0x80 use one byte, longer
//! words escalate through 2/3/4-byte prefixes flagged with 0x80/0xC0/0xE0,
//! and 0xF0 introduces a full 4-byte big-endian length.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Hard ceiling on a single word; API replies are short, anything bigger is
/// a framing desync.
const MAX_WORD_LEN: usize = 1_048_576;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("reserved length prefix {0:#04x}")]
    ReservedPrefix(u8),
    #[error("word of {0} bytes exceeds the frame limit")]
    OversizedWord(usize),
    #[error("word is not valid UTF-8")]
    InvalidUtf8,
}

/// One protocol sentence: a command or a reply, as a list of words.
pub type Sentence = Vec<String>;

/// Codec turning a byte stream into sentences and back.
#[derive(Debug, Default)]
pub struct SentenceCodec {
    words: Vec<String>,
}

impl SentenceCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Try to read one length prefix from `src` without consuming on failure.
/// Returns `None` if more bytes are needed.
fn peek_len(src: &[u8]) -> Result<Option<(usize, usize)>, WireError> {
    let Some(&first) = src.first() else {
        return Ok(None);
    };
    let (need, len) = match first {
        0x00..=0x7F => (1, first as usize),
        0x80..=0xBF => {
            if src.len() < 2 {
                return Ok(None);
            }
            (2, ((first as usize & 0x3F) << 8) | src[1] as usize)
        }
        0xC0..=0xDF => {
            if src.len() < 3 {
                return Ok(None);
            }
            (
                3,
                ((first as usize & 0x1F) << 16) | (src[1] as usize) << 8 | src[2] as usize,
            )
        }
        0xE0..=0xEF => {
            if src.len() < 4 {
                return Ok(None);
            }
            (
                4,
                ((first as usize & 0x0F) << 24)
                    | (src[1] as usize) << 16
                    | (src[2] as usize) << 8
                    | src[3] as usize,
            )
        }
        0xF0 => {
            if src.len() < 5 {
                return Ok(None);
            }
            (
                5,
                (src[1] as usize) << 24
                    | (src[2] as usize) << 16
                    | (src[3] as usize) << 8
                    | src[4] as usize,
            )
        }
        other => return Err(WireError::ReservedPrefix(other)),
    };
    Ok(Some((need, len)))
}

fn put_word_len(dst: &mut BytesMut, len: usize) {
    match len {
        0..=0x7F => dst.put_u8(len as u8),
        0x80..=0x3FFF => dst.put_u16(0x8000 | len as u16),
        0x4000..=0x1F_FFFF => {
            dst.put_u8(0xC0 | (len >> 16) as u8);
            dst.put_u16(len as u16);
        }
        0x20_0000..=0xFFF_FFFF => dst.put_u32(0xE000_0000 | len as u32),
        _ => {
            dst.put_u8(0xF0);
            dst.put_u32(len as u32);
        }
    }
}

impl Decoder for SentenceCodec {
    type Item = Sentence;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some((prefix_len, word_len)) = peek_len(src)? else {
                return Ok(None);
            };
            if word_len > MAX_WORD_LEN {
                return Err(WireError::OversizedWord(word_len));
            }
            if src.len() < prefix_len + word_len {
                return Ok(None);
            }
            src.advance(prefix_len);
            let raw = src.split_to(word_len);
            if word_len == 0 {
                // Sentence terminator.
                return Ok(Some(std::mem::take(&mut self.words)));
            }
            let word = String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)?;
            self.words.push(word);
        }
    }
}

impl Encoder<Sentence> for SentenceCodec {
    type Error = WireError;

    fn encode(&mut self, sentence: Sentence, dst: &mut BytesMut) -> Result<(), Self::Error> {
        for word in &sentence {
            let bytes = word.as_bytes();
            if bytes.len() > MAX_WORD_LEN {
                return Err(WireError::OversizedWord(bytes.len()));
            }
            put_word_len(dst, bytes.len());
            dst.put_slice(bytes);
        }
        put_word_len(dst, 0);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reply interpretation
// ---------------------------------------------------------------------------

/// A reply sentence, split into its tag and attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `!re` -- one data record.
    Re(HashMap<String, String>),
    /// `!done` -- command finished.
    Done(HashMap<String, String>),
    /// `!trap` -- command failed; `message` usually says why.
    Trap(HashMap<String, String>),
    /// `!fatal` -- the device is closing the connection.
    Fatal(String),
}

impl Reply {
    /// Interpret a decoded sentence as a reply. Sentences that do not start
    /// with a reply tag come from a confused peer and are rejected upstream.
    pub fn from_sentence(sentence: &Sentence) -> Option<Reply> {
        let (tag, rest) = sentence.split_first()?;
        match tag.as_str() {
            "!re" => Some(Reply::Re(parse_attributes(rest))),
            "!done" => Some(Reply::Done(parse_attributes(rest))),
            "!trap" => Some(Reply::Trap(parse_attributes(rest))),
            "!fatal" => Some(Reply::Fatal(rest.join(" "))),
            _ => None,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        match self {
            Reply::Re(attrs) | Reply::Done(attrs) | Reply::Trap(attrs) => {
                attrs.get(key).map(String::as_str)
            }
            Reply::Fatal(_) => None,
        }
    }
}

fn parse_attributes(words: &[String]) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    for word in words {
        // Attribute words look like `=key=value`; `.tag=` and query words are
        // not attributes and are skipped.
        if let Some(rest) = word.strip_prefix('=') {
            if let Some((key, value)) = rest.split_once('=') {
                attrs.insert(key.to_string(), value.to_string());
            }
        }
    }
    attrs
}

/// Parse a RouterOS rate value into bits per second.
///
/// `max-limit` normally prints as a plain integer, but accepts and may echo
/// the `k`/`M`/`G` shorthand (decimal multipliers).
pub fn parse_bits(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (digits, multiplier) = match trimmed.chars().last()? {
        'k' | 'K' => (&trimmed[..trimmed.len() - 1], 1_000),
        'm' | 'M' => (&trimmed[..trimmed.len() - 1], 1_000_000),
        'g' | 'G' => (&trimmed[..trimmed.len() - 1], 1_000_000_000),
        _ => (trimmed, 1),
    };
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}
