//! Decoding from named form fields.
//!
//! The form transport carries the same rows as the byte stream, one field
//! per row: field names are `<prefix><hex id>`, text fields hold the row
//! payload with the tag character prefixed (model rows are bare), and
//! binary fields hold raw payloads with the tag in the entry metadata.
//! Fields outside the prefix belong to the surrounding form and are
//! skipped.

use crate::decode::response::{RawRow, Response};
use crate::decode::DecodeOptions;
use crate::error::{Result, RowcodeError};
use crate::format::RowId;
use crate::value::{FormEntry, FormPayload, Value};

pub(crate) fn decode_form_fields(fields: &FormPayload, options: DecodeOptions) -> Result<Value> {
    let prefix = options.identifier_prefix.clone().unwrap_or_default();
    let mut response = Response::new(options);

    for (name, entry) in fields.entries() {
        let Some(suffix) = name.strip_prefix(prefix.as_str()) else {
            continue;
        };
        let Ok(id) = RowId::from_hex(suffix) else {
            log::debug!("skipping foreign form field {name:?}");
            continue;
        };
        let row = match entry {
            FormEntry::Text(text) => split_text_field(id, text),
            FormEntry::Bytes(data, meta) => RawRow {
                id,
                tag: meta
                    .as_deref()
                    .and_then(|m| m.bytes().next())
                    .unwrap_or(b'A'),
                payload: data.clone(),
            },
        };
        response.inject_row(row);
    }
    response.settle();

    match response.read_root() {
        crate::decode::ChunkRead::Ready(value) => Ok(value),
        crate::decode::ChunkRead::Failed(error) => {
            Err(RowcodeError::Serialization(error.message.clone()))
        }
        crate::decode::ChunkRead::Pending => Err(RowcodeError::Format(
            "form fields reference rows that were never provided".into(),
        )),
    }
}

/// Text fields carry newline-delimited rows without the newline. A leading
/// tag letter marks a tagged row; everything else is an untagged model.
fn split_text_field(id: RowId, text: &str) -> RawRow {
    let bytes = text.as_bytes();
    match bytes.first() {
        Some(&first)
            if first.is_ascii_uppercase() || first == b'r' || first == b'x' =>
        {
            RawRow {
                id,
                tag: first,
                payload: bytes[1..].to_vec(),
            }
        }
        _ => RawRow {
            id,
            tag: 0,
            payload: bytes.to_vec(),
        },
    }
}
