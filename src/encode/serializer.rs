//! The model render walk.
//!
//! [`render_model`] turns one value graph into the JSON payload of a row,
//! emitting side rows along the way: binary payloads, outlined containers,
//! import metadata, and subtasks for values that settle later. Reference
//! deduplication happens here too, keyed by storage identity, so aliases
//! and cycles in the input become row references on the wire.
//!
//! The walk itself never suspends. A pending deferred encountered mid-walk
//! becomes a subtask and a `$@` token; only whole tasks wait.

use std::collections::HashSet;
use std::hash::Hasher;
use std::sync::Arc;

use twox_hash::XxHash64;

use crate::encode::request::RequestShared;
use crate::encode::rows::{RowBody, WireRow};
use crate::error::{Result, RowcodeError};
use crate::format::{tag, token, BinaryKind, RowId, TEXT_OUTLINE_THRESHOLD};
use crate::rt::StreamKind;
use crate::value::{ErrorValue, FormEntry, Value, ValueId};

/// Dedup record for one storage identity.
#[derive(Debug, Clone)]
pub(crate) enum ObjectRef {
    /// Sighted once and rendered inline; a second sighting outlines it.
    Seen,
    /// Outlined (or pre-registered as a task root) under this token.
    Written(String),
}

/// A plain `$<hex>` row reference.
pub(crate) fn ref_token(id: RowId) -> String {
    format!("${}", id.to_hex())
}

fn shaped_token(prefix: char, id: RowId) -> String {
    format!("${prefix}{}", id.to_hex())
}

fn token_json(token: String) -> serde_json::Value {
    serde_json::Value::String(token)
}

/// Escapes literal text for a model payload: a leading `$` is doubled.
fn escape_text(text: &str) -> serde_json::Value {
    if text.starts_with(token::PREFIX) {
        serde_json::Value::String(format!("${text}"))
    } else {
        serde_json::Value::String(text.to_owned())
    }
}

fn render_number(n: f64) -> serde_json::Value {
    if n.is_nan() {
        return serde_json::Value::String(token::NAN.to_owned());
    }
    if n == f64::INFINITY {
        return serde_json::Value::String(token::INFINITY.to_owned());
    }
    if n == f64::NEG_INFINITY {
        return serde_json::Value::String(token::NEG_INFINITY.to_owned());
    }
    if n == 0.0 && n.is_sign_negative() {
        return serde_json::Value::String(token::NEG_ZERO.to_owned());
    }
    // Whole numbers inside the exact-integer range print without a
    // fraction, matching what the other side re-parses.
    if n.fract() == 0.0 && n.abs() <= 9_007_199_254_740_992.0 {
        serde_json::Value::Number(serde_json::Number::from(n as i64))
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Pre-render pass over one task's value graph.
///
/// Marks every plain container reachable by two paths, so the render
/// outlines it on first sighting and all paths land on one row. Without
/// this the first occurrence would inline and lose the aliasing.
pub(crate) fn note_repeats(shared: &mut RequestShared, value: &Value) {
    let mut seen = HashSet::new();
    let mut repeats = HashSet::new();
    scan_repeats(value, &mut seen, &mut repeats);
    shared.repeats = repeats;
}

fn scan_repeats(value: &Value, seen: &mut HashSet<ValueId>, repeats: &mut HashSet<ValueId>) {
    let Some(vid) = value.identity() else {
        return;
    };
    if !seen.insert(vid) {
        // Only plain containers need the hint; every other identity kind
        // already outlines on first sighting.
        if matches!(value, Value::Array(_) | Value::Object(_)) {
            repeats.insert(vid);
        }
        return;
    }
    match value {
        Value::Array(list) | Value::Set(list) => {
            for item in list.snapshot() {
                scan_repeats(&item, seen, repeats);
            }
        }
        Value::Object(record) => {
            for (_, field) in record.snapshot() {
                scan_repeats(&field, seen, repeats);
            }
        }
        Value::Map(entries) => {
            for (key, entry) in entries.snapshot() {
                scan_repeats(&key, seen, repeats);
                scan_repeats(&entry, seen, repeats);
            }
        }
        Value::Shared(cell) => scan_repeats(&cell.get(), seen, repeats),
        Value::ServerRef(reference) => {
            if let Some(bound) = reference.bound() {
                scan_repeats(bound, seen, repeats);
            }
        }
        // Deferred and stream contents render in tasks of their own.
        _ => {}
    }
}

/// True when the pre-scan flagged `vid` as shared and no row holds it yet.
fn wants_outline(shared: &RequestShared, vid: ValueId) -> bool {
    shared.repeats.contains(&vid)
        && !matches!(shared.written.get(&vid), Some(ObjectRef::Written(_)))
}

/// Renders one value into model JSON, emitting side rows as needed.
pub(crate) fn render_model(shared: &mut RequestShared, value: &Value) -> Result<serde_json::Value> {
    if let Some(key) = shared
        .temporary_references
        .as_ref()
        .and_then(|set| set.claim(value))
    {
        return Ok(token_json(format!("${}{key}", token::TEMP_REF)));
    }

    let identity = value.identity();
    if let Some(vid) = identity {
        if let Some(message) = shared.taint.as_ref().and_then(|t| t.check_identity(vid)) {
            return Err(RowcodeError::Tainted(message));
        }
        if shared.model_root == Some(vid) {
            // The row's own value renders inline exactly once.
            shared.model_root = None;
        } else {
            match shared.written.get(&vid) {
                Some(ObjectRef::Written(token)) => return Ok(token_json(token.clone())),
                Some(ObjectRef::Seen) => return outline_repeat(shared, value, vid),
                None => {}
            }
        }
    }

    match value {
        Value::Null => Ok(serde_json::Value::Null),
        Value::Undefined => Ok(token_json(token::UNDEFINED.to_owned())),
        Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Number(n) => Ok(render_number(*n)),
        Value::BigInt(int) => {
            if let Some(message) = shared.taint.as_ref().and_then(|t| t.check_value(value)) {
                return Err(RowcodeError::Tainted(message));
            }
            Ok(token_json(format!("${}{int}", token::BIGINT)))
        }
        Value::String(text) => {
            if let Some(message) = shared.taint.as_ref().and_then(|t| t.check_value(value)) {
                return Err(RowcodeError::Tainted(message));
            }
            if shared.text_outline && text.len() > TEXT_OUTLINE_THRESHOLD {
                let id = shared.alloc_id();
                shared.regular_queue.push_back(WireRow {
                    id,
                    body: RowBody::Text(text.to_string()),
                });
                return Ok(token_json(ref_token(id)));
            }
            Ok(escape_text(text))
        }
        Value::Date(iso) => Ok(token_json(format!("${}{iso}", token::DATE))),
        Value::Symbol(name) => {
            if let Some(id) = shared.written_symbols.get(name).copied() {
                return Ok(token_json(ref_token(id)));
            }
            let id = shared.alloc_id();
            let payload =
                serde_json::Value::String(format!("${}{name}", token::SYMBOL)).to_string();
            shared.import_queue.push_back(WireRow {
                id,
                body: RowBody::Model(payload),
            });
            shared.written_symbols.insert(Arc::clone(name), id);
            Ok(token_json(ref_token(id)))
        }
        Value::TempRef(key) => Ok(token_json(format!("${}{key}", token::TEMP_REF))),
        Value::Binary(binary) => {
            if let Some(message) = shared.taint.as_ref().and_then(|t| t.check_value(value)) {
                return Err(RowcodeError::Tainted(message));
            }
            let id = shared.alloc_id();
            let reference = ref_token(id);
            self_register(shared, identity, &reference);
            shared.regular_queue.push_back(WireRow {
                id,
                body: RowBody::Binary {
                    tag: binary.kind().row_tag(),
                    data: binary.data_shared(),
                },
            });
            Ok(token_json(reference))
        }
        Value::Array(list) => {
            if let Some(vid) = identity.filter(|vid| wants_outline(shared, *vid)) {
                return outline_repeat(shared, value, vid);
            }
            mark_seen(shared, identity);
            let mut items = Vec::with_capacity(list.len());
            for item in list.snapshot() {
                items.push(render_model(shared, &item)?);
            }
            Ok(serde_json::Value::Array(items))
        }
        Value::Object(record) => {
            if let Some(vid) = identity.filter(|vid| wants_outline(shared, *vid)) {
                return outline_repeat(shared, value, vid);
            }
            mark_seen(shared, identity);
            let mut fields = serde_json::Map::new();
            for (key, field) in record.snapshot() {
                fields.insert(key.to_string(), render_model(shared, &field)?);
            }
            Ok(serde_json::Value::Object(fields))
        }
        Value::Map(entries) => {
            let id = shared.alloc_id();
            let reference = shaped_token(token::MAP, id);
            self_register(shared, identity, &reference);
            let mut pairs = Vec::new();
            for (key, entry) in entries.snapshot() {
                pairs.push(serde_json::Value::Array(vec![
                    render_model(shared, &key)?,
                    render_model(shared, &entry)?,
                ]));
            }
            emit_model_row(shared, id, serde_json::Value::Array(pairs));
            Ok(token_json(reference))
        }
        Value::Set(items) => {
            let id = shared.alloc_id();
            let reference = shaped_token(token::SET, id);
            self_register(shared, identity, &reference);
            let mut rendered = Vec::with_capacity(items.len());
            for item in items.snapshot() {
                rendered.push(render_model(shared, &item)?);
            }
            emit_model_row(shared, id, serde_json::Value::Array(rendered));
            Ok(token_json(reference))
        }
        Value::Blob(blob) => {
            let id = outline_blob(shared, &blob.mime, &blob.data);
            let reference = shaped_token(token::BLOB, id);
            self_register(shared, identity, &reference);
            Ok(token_json(reference))
        }
        Value::Form(form) => {
            let id = shared.alloc_id();
            let reference = shaped_token(token::FORM_DATA, id);
            self_register(shared, identity, &reference);
            let mut pairs = Vec::with_capacity(form.len());
            for (name, entry) in form.entries() {
                let rendered = match entry {
                    FormEntry::Text(text) => escape_text(text),
                    FormEntry::Bytes(data, Some(mime)) => {
                        token_json(shaped_token(token::BLOB, outline_blob(shared, mime, data)))
                    }
                    FormEntry::Bytes(data, None) => {
                        let bin_id = shared.alloc_id();
                        shared.regular_queue.push_back(WireRow {
                            id: bin_id,
                            body: RowBody::Binary {
                                tag: BinaryKind::Buffer.row_tag(),
                                data: Arc::from(data.as_slice()),
                            },
                        });
                        token_json(ref_token(bin_id))
                    }
                };
                pairs.push(serde_json::Value::Array(vec![
                    serde_json::Value::String(name.clone()),
                    rendered,
                ]));
            }
            emit_model_row(shared, id, serde_json::Value::Array(pairs));
            Ok(token_json(reference))
        }
        Value::Error(error) => {
            let id = shared.alloc_id();
            let reference = shaped_token(token::ERROR, id);
            self_register(shared, identity, &reference);
            // Errors travelling as data keep their own digest; the error
            // hook only sees failures, not payloads.
            let digest = error
                .digest
                .clone()
                .unwrap_or_else(|| default_digest(&error.message));
            let mut fields = serde_json::Map::new();
            fields.insert("digest".into(), digest.into());
            if shared.debug {
                fields.insert("message".into(), error.message.clone().into());
                if let Some(stack) = &error.stack {
                    fields.insert("stack".into(), stack.clone().into());
                }
            }
            emit_model_row(shared, id, serde_json::Value::Object(fields));
            Ok(token_json(reference))
        }
        Value::Shared(cell) => {
            let id = shared.alloc_id();
            let reference = ref_token(id);
            self_register(shared, identity, &reference);
            let inner = cell.get();
            let json = render_model(shared, &inner)?;
            emit_model_row(shared, id, json);
            Ok(token_json(reference))
        }
        Value::Deferred(cell) => {
            if cell.is_hanging() {
                return Ok(token_json(token::HANGING.to_owned()));
            }
            let id = shared.alloc_id();
            let reference = shaped_token(token::DEFERRED, id);
            self_register(shared, identity, &reference);
            shared.spawn_model_task(id, cell.clone());
            Ok(token_json(reference))
        }
        Value::Stream(stream) => {
            let id = shared.alloc_id();
            let reference = ref_token(id);
            self_register(shared, identity, &reference);
            let start = match stream.kind() {
                StreamKind::Readable => tag::STREAM,
                StreamKind::ReadableBytes => tag::BYTE_STREAM,
                StreamKind::AsyncIterable => tag::ITERABLE,
                StreamKind::AsyncIterator => tag::ITERATOR,
            };
            shared.regular_queue.push_back(WireRow {
                id,
                body: RowBody::Tagged {
                    tag: start,
                    text: String::new(),
                },
            });
            shared.spawn_stream_task(id, stream.clone());
            Ok(token_json(reference))
        }
        Value::ClientRef(client_ref) => {
            if let Some(id) = shared.written_refs.get(client_ref.key()).copied() {
                return Ok(token_json(ref_token(id)));
            }
            let resolved = shared
                .manifest
                .as_ref()
                .and_then(|m| m.resolve(client_ref.key()));
            match resolved {
                Some(metadata) => {
                    let id = shared.alloc_id();
                    shared.import_queue.push_back(WireRow {
                        id,
                        body: RowBody::Tagged {
                            tag: tag::IMPORT,
                            text: metadata.to_json().to_string(),
                        },
                    });
                    shared.written_refs.insert(client_ref.key().to_owned(), id);
                    Ok(token_json(ref_token(id)))
                }
                None => {
                    // Recoverable: this position decodes to a rejection,
                    // the rest of the session is unaffected.
                    let error = ErrorValue::new(format!(
                        "Could not find the module \"{}\" in the module manifest",
                        client_ref.key()
                    ));
                    let err_id = shared.emit_error_row(&error);
                    Ok(token_json(shaped_token(token::LAZY, err_id)))
                }
            }
        }
        Value::ServerRef(server_ref) => {
            let id = shared.alloc_id();
            let reference = shaped_token(token::SERVER_REF, id);
            self_register(shared, identity, &reference);
            let mut fields = serde_json::Map::new();
            fields.insert("id".into(), server_ref.key().to_owned().into());
            if let Some(bound) = server_ref.bound() {
                fields.insert("bound".into(), render_model(shared, bound)?);
            }
            emit_model_row(shared, id, serde_json::Value::Object(fields));
            Ok(token_json(reference))
        }
    }
}

/// Records a first sighting of a plain container without outlining it.
fn mark_seen(shared: &mut RequestShared, identity: Option<ValueId>) {
    if let Some(vid) = identity {
        shared.written.entry(vid).or_insert(ObjectRef::Seen);
    }
}

/// Registers an outlined value's token before its content renders, so the
/// content can reference the value itself.
fn self_register(shared: &mut RequestShared, identity: Option<ValueId>, reference: &str) {
    if let Some(vid) = identity {
        shared
            .written
            .insert(vid, ObjectRef::Written(reference.to_owned()));
    }
}

/// Outlines a repeated plain container into its own row.
fn outline_repeat(
    shared: &mut RequestShared,
    value: &Value,
    vid: ValueId,
) -> Result<serde_json::Value> {
    let id = shared.alloc_id();
    let reference = ref_token(id);
    shared
        .written
        .insert(vid, ObjectRef::Written(reference.clone()));
    let saved = shared.model_root.replace(vid);
    let json = render_model(shared, value)?;
    shared.model_root = saved;
    emit_model_row(shared, id, json);
    Ok(token_json(reference))
}

fn outline_blob(shared: &mut RequestShared, mime: &str, data: &[u8]) -> RowId {
    let bytes_id = shared.alloc_id();
    shared.regular_queue.push_back(WireRow {
        id: bytes_id,
        body: RowBody::Binary {
            tag: BinaryKind::Buffer.row_tag(),
            data: Arc::from(data),
        },
    });
    let id = shared.alloc_id();
    emit_model_row(
        shared,
        id,
        serde_json::Value::Array(vec![
            serde_json::Value::String(mime.to_owned()),
            serde_json::Value::String(ref_token(bytes_id)),
        ]),
    );
    id
}

fn emit_model_row(shared: &mut RequestShared, id: RowId, json: serde_json::Value) {
    shared.regular_queue.push_back(WireRow {
        id,
        body: RowBody::Model(json.to_string()),
    });
}

/// Converts a plain data value into JSON, with no reference tokens.
///
/// Used for hint payloads, which are defined to carry data only.
pub(crate) fn plain_to_json(value: &Value) -> Result<serde_json::Value> {
    match value {
        Value::Null => Ok(serde_json::Value::Null),
        Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .ok_or_else(|| {
                RowcodeError::Serialization("hint payloads cannot carry NaN or infinity".into())
            }),
        Value::String(text) => Ok(serde_json::Value::String(text.to_string())),
        Value::Array(items) => {
            let mut rendered = Vec::with_capacity(items.len());
            for item in items.snapshot() {
                rendered.push(plain_to_json(&item)?);
            }
            Ok(serde_json::Value::Array(rendered))
        }
        Value::Object(record) => {
            let mut fields = serde_json::Map::new();
            for (key, field) in record.snapshot() {
                fields.insert(key.to_string(), plain_to_json(&field)?);
            }
            Ok(serde_json::Value::Object(fields))
        }
        _ => Err(RowcodeError::Serialization(
            "hint payloads must be plain JSON data".into(),
        )),
    }
}

/// Digest used when no error hook is installed (or it declines): a stable
/// hash of the message, good enough to correlate with remote logs.
pub(crate) fn default_digest(message: &str) -> String {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(message.as_bytes());
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn numbers_use_tokens_for_the_non_json_edge_cases() {
        assert_eq!(render_number(2.0), serde_json::json!(2));
        assert_eq!(render_number(2.5), serde_json::json!(2.5));
        assert_eq!(render_number(f64::NAN), serde_json::json!("$NaN"));
        assert_eq!(render_number(f64::INFINITY), serde_json::json!("$Infinity"));
        assert_eq!(
            render_number(f64::NEG_INFINITY),
            serde_json::json!("$-Infinity")
        );
        assert_eq!(render_number(-0.0), serde_json::json!("$-0"));
        assert_eq!(render_number(0.0), serde_json::json!(0));
    }

    #[test]
    fn dollar_strings_are_escaped() {
        assert_eq!(escape_text("plain"), serde_json::json!("plain"));
        assert_eq!(escape_text("$1"), serde_json::json!("$$1"));
        assert_eq!(escape_text("$$x"), serde_json::json!("$$$x"));
    }

    #[test]
    fn default_digests_are_stable() {
        let a = default_digest("boom");
        let b = default_digest("boom");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, default_digest("bust"));
    }

    #[test]
    fn plain_json_rejects_reference_values() {
        let err = plain_to_json(&Value::Deferred(crate::rt::DeferredValue::new()));
        assert!(err.is_err());
        let ok = plain_to_json(&Value::array([Value::from(1), Value::from("x")]));
        assert_eq!(ok.unwrap(), serde_json::json!([1, "x"]));
    }
}
