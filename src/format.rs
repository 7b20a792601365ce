//! Defines the physical layout of the row protocol.
//!
//! # Row Layout
//! A stream is a sequence of self-describing rows. Two framings exist:
//!
//! Text rows: `<hexId>:<tag><payload>\n`
//!
//! Length-delimited rows: `<hexId>:<tag><hexLength>,<raw bytes>`, where
//! exactly `hexLength` bytes follow the comma with no trailing newline;
//! the next row begins immediately after.
//!
//! The tag is a single byte. Which framing applies is decided by the tag
//! byte itself (see [`TagClass`]): the text tag `T` and the binary tags are
//! length-delimited, every other uppercase letter plus `r` and `x` is
//! newline-delimited, and anything else means the row is an untagged model
//! row whose payload starts at that byte.
//!
//! Hint rows are the one id-less frame: `:H<code><json>\n`.
//!
//! # Reference Tokens
//! Inside model payloads, strings beginning with `$` form the escape
//! namespace for non-JSON values and row references; a literal `$` is
//! escaped by doubling. The constants in this module are the single source
//! of truth for that vocabulary.

use std::fmt;

use crate::error::{Result, RowcodeError};

/// Strings at least this many bytes long are outlined into their own
/// length-delimited text row instead of being embedded in JSON.
pub const TEXT_OUTLINE_THRESHOLD: usize = 1024;

/// Reason attached to chunks that are still unresolved when a stream ends.
pub const CONNECTION_CLOSED: &str = "Connection closed.";

// --- ROW IDS ---

/// Identifier of one wire row, allocated monotonically per session.
///
/// Ids appear hex-encoded (lowercase) in the framing and inside reference
/// tokens. The root of a session is always row 0.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId(pub u32);

impl RowId {
    /// The root row of every session.
    pub const ROOT: RowId = RowId(0);

    /// Renders the id the way it appears on the wire.
    pub fn to_hex(self) -> String {
        format!("{:x}", self.0)
    }

    /// Parses a bare lowercase-hex id, as found inside reference tokens.
    pub fn from_hex(text: &str) -> Result<Self> {
        if text.is_empty() {
            return Err(RowcodeError::Format("empty row id".into()));
        }
        let mut acc: u32 = 0;
        for &byte in text.as_bytes() {
            acc = (acc << 4) | hex_nibble(byte)?;
        }
        Ok(RowId(acc))
    }
}

impl fmt::Debug for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowId({})", self.0)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Decodes one hex digit. Only lowercase letters are valid on the wire.
pub(crate) fn hex_nibble(byte: u8) -> Result<u32> {
    match byte {
        b'0'..=b'9' => Ok(u32::from(byte - b'0')),
        b'a'..=b'f' => Ok(u32::from(byte - b'a' + 10)),
        _ => Err(RowcodeError::Format(format!(
            "invalid hex digit 0x{byte:02x} in row framing"
        ))),
    }
}

// --- ROW TAGS ---

/// Binary payload element kinds, one per length-delimited binary tag.
///
/// The letter encodes element type and width; payloads are raw
/// little-endian element bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryKind {
    /// `A`: an untyped byte buffer.
    Buffer,
    /// `O`: signed 8-bit elements.
    I8,
    /// `o`: unsigned 8-bit elements.
    U8,
    /// `U`: unsigned 8-bit elements with clamped-write semantics.
    U8Clamped,
    /// `S`: signed 16-bit elements.
    I16,
    /// `s`: unsigned 16-bit elements.
    U16,
    /// `L`: signed 32-bit elements.
    I32,
    /// `l`: unsigned 32-bit elements.
    U32,
    /// `F`: 16-bit float elements, carried as raw bits.
    F16,
    /// `G`: 32-bit float elements.
    F32,
    /// `g`: 64-bit float elements.
    F64,
    /// `M`: signed 64-bit elements.
    I64,
    /// `m`: unsigned 64-bit elements.
    U64,
    /// `V`: a raw byte view over a buffer.
    View,
}

impl BinaryKind {
    /// The row tag byte for this kind.
    pub fn row_tag(self) -> u8 {
        match self {
            Self::Buffer => b'A',
            Self::I8 => b'O',
            Self::U8 => b'o',
            Self::U8Clamped => b'U',
            Self::I16 => b'S',
            Self::U16 => b's',
            Self::I32 => b'L',
            Self::U32 => b'l',
            Self::F16 => b'F',
            Self::F32 => b'G',
            Self::F64 => b'g',
            Self::I64 => b'M',
            Self::U64 => b'm',
            Self::View => b'V',
        }
    }

    /// Maps a row tag byte back to its kind.
    pub fn from_row_tag(byte: u8) -> Option<Self> {
        Some(match byte {
            b'A' => Self::Buffer,
            b'O' => Self::I8,
            b'o' => Self::U8,
            b'U' => Self::U8Clamped,
            b'S' => Self::I16,
            b's' => Self::U16,
            b'L' => Self::I32,
            b'l' => Self::U32,
            b'F' => Self::F16,
            b'G' => Self::F32,
            b'g' => Self::F64,
            b'M' => Self::I64,
            b'm' => Self::U64,
            b'V' => Self::View,
            _ => return None,
        })
    }

    /// Bytes per element; payload lengths must be a multiple of this.
    pub fn element_width(self) -> usize {
        match self {
            Self::Buffer | Self::I8 | Self::U8 | Self::U8Clamped | Self::View => 1,
            Self::I16 | Self::U16 | Self::F16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 | Self::I64 | Self::U64 => 8,
        }
    }
}

/// Newline-delimited (non-binary) row tags.
pub mod tag {
    /// Import/module metadata row.
    pub const IMPORT: u8 = b'I';
    /// Hint row; the byte after the tag is the hint code.
    pub const HINT: u8 = b'H';
    /// Error row.
    pub const ERROR: u8 = b'E';
    /// Postpone row.
    pub const POSTPONE: u8 = b'P';
    /// Length-delimited UTF-8 text row.
    pub const TEXT: u8 = b'T';
    /// Debug-info row.
    pub const DEBUG_INFO: u8 = b'D';
    /// Console-replay row.
    pub const CONSOLE: u8 = b'W';
    /// Stream start row.
    pub const STREAM: u8 = b'R';
    /// Byte-stream start row.
    pub const BYTE_STREAM: u8 = b'r';
    /// Async-iterable start row.
    pub const ITERABLE: u8 = b'X';
    /// Async-iterator start row.
    pub const ITERATOR: u8 = b'x';
    /// Close row for streaming ids; may carry a final value payload.
    pub const STREAM_CLOSE: u8 = b'C';
}

/// How the parser must frame a row, decided by its tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    /// `<hexLength>,` then exactly that many raw bytes.
    LengthDelimited,
    /// Payload runs to the next `\n`.
    NewlineDelimited,
    /// The byte is not a tag at all: it already belongs to an untagged
    /// model payload, which runs to the next `\n`.
    Payload,
}

/// Classifies a candidate tag byte.
///
/// Unrecognized uppercase tags still consume the byte and fall back to
/// model handling after framing, which is what keeps old decoders able to
/// skip over rows introduced later.
pub fn classify_tag(byte: u8) -> TagClass {
    if byte == tag::TEXT || BinaryKind::from_row_tag(byte).is_some() {
        TagClass::LengthDelimited
    } else if byte.is_ascii_uppercase() || byte == tag::BYTE_STREAM || byte == tag::ITERATOR {
        TagClass::NewlineDelimited
    } else {
        TagClass::Payload
    }
}

// --- REFERENCE TOKENS ---

/// The `$`-token vocabulary used inside model payloads.
pub mod token {
    /// Every token starts with this byte; literal strings double it.
    pub const PREFIX: char = '$';
    /// The `undefined` scalar.
    pub const UNDEFINED: &str = "$undefined";
    /// IEEE NaN.
    pub const NAN: &str = "$NaN";
    /// Positive infinity.
    pub const INFINITY: &str = "$Infinity";
    /// Negative infinity.
    pub const NEG_INFINITY: &str = "$-Infinity";
    /// IEEE negative zero.
    pub const NEG_ZERO: &str = "$-0";
    /// A deferred value that will never settle.
    pub const HANGING: &str = "$@";
    /// `$n<decimal>` big integer.
    pub const BIGINT: char = 'n';
    /// `$D<ISO-8601>` date.
    pub const DATE: char = 'D';
    /// `$S<name>` globally-registered symbol.
    pub const SYMBOL: char = 'S';
    /// `$Q<id>` map via outlined entry array.
    pub const MAP: char = 'Q';
    /// `$W<id>` set via outlined entry array.
    pub const SET: char = 'W';
    /// `$B<id>` blob via outlined `[mime, bytes]` row.
    pub const BLOB: char = 'B';
    /// `$K<id>` form payload via outlined entry array.
    pub const FORM_DATA: char = 'K';
    /// `$Z<id>` error value via outlined descriptor row.
    pub const ERROR: char = 'Z';
    /// `$F<id>` server function reference via outlined metadata row.
    pub const SERVER_REF: char = 'F';
    /// `$T<key>` temporary reference; the key never appears as a row.
    pub const TEMP_REF: char = 'T';
    /// `$L<id>` lazy wrapper around a row reference.
    pub const LAZY: char = 'L';
    /// `$@<id>` deferred value backed by a row.
    pub const DEFERRED: char = '@';
}

// --- ROW PAYLOADS ---

/// JSON body of an `E` row.
///
/// `message` and `stack` travel only in debug sessions; a decoder seeing
/// an empty message substitutes its redaction notice.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub(crate) struct ErrorRowPayload {
    pub(crate) digest: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub(crate) message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) stack: Option<String>,
}

/// JSON body of a `P` row. Production sessions send an empty payload
/// instead.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub(crate) struct PostponeRowPayload {
    pub(crate) reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) stack: Option<String>,
}

// --- FRAME WRITERS ---

/// Appends a newline-delimited row: `<hexId>:<tag><payload>\n`.
///
/// `tag` is `None` for untagged model rows.
pub fn write_text_row(out: &mut Vec<u8>, id: RowId, row_tag: Option<u8>, payload: &str) {
    out.extend_from_slice(id.to_hex().as_bytes());
    out.push(b':');
    if let Some(t) = row_tag {
        out.push(t);
    }
    out.extend_from_slice(payload.as_bytes());
    out.push(b'\n');
}

/// Appends a length-delimited row: `<hexId>:<tag><hexLen>,<bytes>`.
pub fn write_length_row(out: &mut Vec<u8>, id: RowId, row_tag: u8, bytes: &[u8]) {
    out.extend_from_slice(id.to_hex().as_bytes());
    out.push(b':');
    out.push(row_tag);
    out.extend_from_slice(format!("{:x}", bytes.len()).as_bytes());
    out.push(b',');
    out.extend_from_slice(bytes);
}

/// Appends the id-less hint frame: `:H<code><json>\n`.
pub fn write_hint_row(out: &mut Vec<u8>, code: u8, json: &str) {
    out.push(b':');
    out.push(tag::HINT);
    out.push(code);
    out.extend_from_slice(json.as_bytes());
    out.push(b'\n');
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn row_ids_round_trip_through_hex() {
        for raw in [0u32, 1, 10, 15, 16, 255, 4096, 0xdead_beef] {
            let id = RowId(raw);
            assert_eq!(RowId::from_hex(&id.to_hex()).unwrap(), id);
        }
        assert!(RowId::from_hex("").is_err());
        assert!(RowId::from_hex("1G").is_err());
        assert!(RowId::from_hex("A").is_err(), "wire ids are lowercase");
    }

    #[test]
    fn tag_classification_matches_framing_rules() {
        assert_eq!(classify_tag(b'T'), TagClass::LengthDelimited);
        assert_eq!(classify_tag(b'o'), TagClass::LengthDelimited);
        assert_eq!(classify_tag(b'V'), TagClass::LengthDelimited);
        assert_eq!(classify_tag(b'F'), TagClass::LengthDelimited);
        assert_eq!(classify_tag(b'I'), TagClass::NewlineDelimited);
        assert_eq!(classify_tag(b'J'), TagClass::NewlineDelimited);
        assert_eq!(classify_tag(b'r'), TagClass::NewlineDelimited);
        assert_eq!(classify_tag(b'x'), TagClass::NewlineDelimited);
        assert_eq!(classify_tag(b'{'), TagClass::Payload);
        assert_eq!(classify_tag(b'"'), TagClass::Payload);
        assert_eq!(classify_tag(b'3'), TagClass::Payload);
    }

    #[test]
    fn binary_kinds_round_trip_and_declare_widths() {
        let kinds = [
            BinaryKind::Buffer,
            BinaryKind::I8,
            BinaryKind::U8,
            BinaryKind::U8Clamped,
            BinaryKind::I16,
            BinaryKind::U16,
            BinaryKind::I32,
            BinaryKind::U32,
            BinaryKind::F16,
            BinaryKind::F32,
            BinaryKind::F64,
            BinaryKind::I64,
            BinaryKind::U64,
            BinaryKind::View,
        ];
        for kind in kinds {
            assert_eq!(BinaryKind::from_row_tag(kind.row_tag()), Some(kind));
            assert!(kind.element_width().is_power_of_two());
        }
        assert_eq!(BinaryKind::from_row_tag(b'Z'), None);
    }

    #[test]
    fn frame_writers_emit_expected_bytes() {
        let mut out = Vec::new();
        write_text_row(&mut out, RowId(26), None, "{\"a\":1}");
        assert_eq!(out, b"1a:{\"a\":1}\n");

        out.clear();
        write_length_row(&mut out, RowId(3), b'o', &[1, 2, 3]);
        assert_eq!(out, b"3:o3,\x01\x02\x03");

        out.clear();
        write_hint_row(&mut out, b'L', "[\"/style.css\",\"style\"]");
        assert_eq!(out, b":HL[\"/style.css\",\"style\"]\n");
    }
}
