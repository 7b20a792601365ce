//! Turning parsed row payloads into live values.
//!
//! A model row is JSON with an escape hatch: strings starting with `$`
//! are reference tokens instead of text. The reviver walks the JSON,
//! builds shared containers top-down, and resolves tokens in place.
//! Containers are published into their parent slot *before* their
//! children are walked, so references back into the row under
//! construction can be patched without re-walking anything.
//!
//! References to other rows go through [`reference`], which either fills
//! the slot immediately or parks a listener on the target chunk and
//! counts a dependency against the row being initialized.

use std::sync::Arc;

use crate::decode::chunk::{Chunk, ChunkKey, Listener, Shape, Slot};
use crate::decode::response::ResponseState;
use crate::error::RowcodeError;
use crate::format::RowId;
use crate::modules::ServerReference;
use crate::rt::DeferredValue;
use crate::value::{
    BlobValue, ErrorValue, FormEntry, FormPayload, SharedEntries, SharedList, SharedRecord, Value,
};

/// Per-row bookkeeping threaded through one initialization walk.
#[derive(Debug)]
pub(crate) struct InitContext {
    /// The chunk being initialized.
    pub(crate) row: ChunkKey,
    /// References found during the walk that are not resolved yet.
    pub(crate) deps: u32,
    /// Slots referencing the row itself, filled once the walk completes.
    pub(crate) fixups: Vec<(Slot, Shape)>,
}

impl InitContext {
    pub(crate) fn new(row: ChunkKey) -> Self {
        Self {
            row,
            deps: 0,
            fixups: Vec::new(),
        }
    }
}

pub(crate) type ReviveResult = Result<(), Arc<ErrorValue>>;

fn format_err(message: impl Into<String>) -> Arc<ErrorValue> {
    Arc::new(ErrorValue::from(RowcodeError::Format(message.into())))
}

fn json_number(n: &serde_json::Number) -> Value {
    // Integers on the wire carry at most double precision.
    if let Some(i) = n.as_i64() {
        Value::Number(i as f64)
    } else if let Some(u) = n.as_u64() {
        Value::Number(u as f64)
    } else {
        Value::Number(n.as_f64().unwrap_or(f64::NAN))
    }
}

/// Revives one JSON fragment into `slot`.
pub(crate) fn revive(
    state: &mut ResponseState,
    ctx: &mut InitContext,
    json: &serde_json::Value,
    slot: Slot,
) -> ReviveResult {
    match json {
        serde_json::Value::Null => {
            slot.fill(Value::Null);
            Ok(())
        }
        serde_json::Value::Bool(b) => {
            slot.fill(Value::Bool(*b));
            Ok(())
        }
        serde_json::Value::Number(n) => {
            slot.fill(json_number(n));
            Ok(())
        }
        serde_json::Value::String(s) => revive_string(state, ctx, s, slot),
        serde_json::Value::Array(items) => {
            let list = SharedList::from_vec(vec![Value::Null; items.len()]);
            slot.fill(Value::Array(list.clone()));
            for (index, item) in items.iter().enumerate() {
                revive(state, ctx, item, Slot::ListIndex(list.clone(), index))?;
            }
            Ok(())
        }
        serde_json::Value::Object(fields) => {
            let record = SharedRecord::new();
            slot.fill(Value::Object(record.clone()));
            for (key, field) in fields {
                let key: Arc<str> = Arc::from(key.as_str());
                // Reserve the key up front so late-filled references keep
                // their position in the record.
                record.insert(Arc::clone(&key), Value::Null);
                revive(state, ctx, field, Slot::RecordKey(record.clone(), key))?;
            }
            Ok(())
        }
    }
}

/// Decodes a string payload: either plain text or a `$` reference token.
fn revive_string(
    state: &mut ResponseState,
    ctx: &mut InitContext,
    text: &str,
    slot: Slot,
) -> ReviveResult {
    let bytes = text.as_bytes();
    if bytes.first() != Some(&b'$') {
        slot.fill(Value::from(text));
        return Ok(());
    }
    if bytes.len() == 1 {
        return Err(format_err("unexpected bare reference marker"));
    }
    match bytes[1] {
        // "$$..." escapes a real dollar string.
        b'$' => {
            slot.fill(Value::from(&text[1..]));
            Ok(())
        }
        b'@' => {
            if bytes.len() == 2 {
                slot.fill(Value::Deferred(DeferredValue::hanging()));
                Ok(())
            } else {
                let target = parse_target(text, 2)?;
                lazy_reference(state, target, slot)
            }
        }
        b'L' => {
            let target = parse_target(text, 2)?;
            lazy_reference(state, target, slot)
        }
        b'S' => {
            slot.fill(Value::Symbol(Arc::from(&text[2..])));
            Ok(())
        }
        b'F' => {
            let target = parse_target(text, 2)?;
            reference(state, ctx, target, Shape::ServerRef, slot)
        }
        b'T' => {
            let key = &text[2..];
            let resolved = state
                .options
                .temporary_references
                .as_ref()
                .and_then(|set| set.resolve(key));
            match resolved {
                Some(value) => {
                    slot.fill(value);
                    Ok(())
                }
                None => Err(format_err(format!(
                    "missing temporary reference {key:?}"
                ))),
            }
        }
        b'Q' => {
            let target = parse_target(text, 2)?;
            reference(state, ctx, target, Shape::MapEntries, slot)
        }
        b'W' => {
            let target = parse_target(text, 2)?;
            reference(state, ctx, target, Shape::SetEntries, slot)
        }
        b'B' => {
            let target = parse_target(text, 2)?;
            reference(state, ctx, target, Shape::Blob, slot)
        }
        b'K' => {
            let target = parse_target(text, 2)?;
            reference(state, ctx, target, Shape::FormData, slot)
        }
        b'Z' => {
            let target = parse_target(text, 2)?;
            reference(state, ctx, target, Shape::ErrorValue, slot)
        }
        b'I' => {
            slot.fill(Value::Number(f64::INFINITY));
            Ok(())
        }
        b'N' => {
            slot.fill(Value::Number(f64::NAN));
            Ok(())
        }
        b'u' => {
            slot.fill(Value::Undefined);
            Ok(())
        }
        b'-' => {
            if text == "$-0" {
                slot.fill(Value::Number(-0.0));
                Ok(())
            } else if text.starts_with("$-I") {
                slot.fill(Value::Number(f64::NEG_INFINITY));
                Ok(())
            } else {
                Err(format_err(format!("malformed numeric token {text:?}")))
            }
        }
        b'D' => {
            slot.fill(Value::Date(Arc::from(&text[2..])));
            Ok(())
        }
        b'n' => match text[2..].parse::<i128>() {
            Ok(int) => {
                slot.fill(Value::BigInt(int));
                Ok(())
            }
            Err(_) => Err(format_err(format!("invalid bigint payload {text:?}"))),
        },
        b'i' | b'E' | b'Y' => Err(format_err(format!(
            "unsupported reference token {text:?}"
        ))),
        _ => {
            let target = parse_target(text, 1)?;
            reference(state, ctx, target, Shape::Model, slot)
        }
    }
}

fn parse_target(token: &str, offset: usize) -> Result<RowId, Arc<ErrorValue>> {
    RowId::from_hex(&token[offset..])
        .map_err(|_| format_err(format!("malformed reference token {token:?}")))
}

/// Which lazy initialization a probed chunk still needs.
enum NeedsInit {
    Model,
    Module,
}

/// Resolves a reference to another row, blocking the current row if the
/// target is not settled yet.
pub(crate) fn reference(
    state: &mut ResponseState,
    ctx: &mut InitContext,
    target: RowId,
    shape: Shape,
    slot: Slot,
) -> ReviveResult {
    let key = ChunkKey::Wire(target);
    if key == ctx.row {
        // A row referencing itself cannot read its own value mid-walk;
        // patch the slot when the walk completes.
        ctx.fixups.push((slot, shape));
        return Ok(());
    }
    loop {
        let needs_init = match state.chunks.get_mut(&key) {
            Some(Chunk::Fulfilled(value)) => {
                let value = value.clone();
                slot.fill(apply_shape(shape, &value)?);
                return Ok(());
            }
            Some(Chunk::Rejected(error)) => return Err(Arc::clone(error)),
            Some(Chunk::ResolvedModel(_)) => NeedsInit::Model,
            Some(Chunk::ResolvedModule(_)) => NeedsInit::Module,
            Some(
                Chunk::Pending(listeners)
                | Chunk::PreloadingModule { listeners, .. }
                | Chunk::Blocked { listeners, .. },
            ) => {
                listeners.push(Listener::Slot {
                    slot,
                    shape,
                    blocked: ctx.row,
                });
                ctx.deps += 1;
                return Ok(());
            }
            None => {
                state.chunks.insert(
                    key,
                    Chunk::Pending(vec![Listener::Slot {
                        slot,
                        shape,
                        blocked: ctx.row,
                    }]),
                );
                ctx.deps += 1;
                return Ok(());
            }
        };
        match needs_init {
            NeedsInit::Model => state.initialize_model_chunk(key),
            NeedsInit::Module => state.initialize_module_chunk(key),
        }
    }
}

/// Resolves a `$L`/`$@` reference: the slot gets a deferred immediately
/// and the current row never blocks on the target.
fn lazy_reference(state: &mut ResponseState, target: RowId, slot: Slot) -> ReviveResult {
    let key = ChunkKey::Wire(target);
    loop {
        let needs_init = match state.chunks.get_mut(&key) {
            Some(Chunk::Fulfilled(value)) => {
                slot.fill(Value::Deferred(DeferredValue::fulfilled(value.clone())));
                return Ok(());
            }
            Some(Chunk::Rejected(error)) => {
                slot.fill(Value::Deferred(DeferredValue::rejected(
                    error.as_ref().clone(),
                )));
                return Ok(());
            }
            Some(Chunk::ResolvedModel(_)) => NeedsInit::Model,
            Some(Chunk::ResolvedModule(_)) => NeedsInit::Module,
            Some(
                Chunk::Pending(listeners)
                | Chunk::PreloadingModule { listeners, .. }
                | Chunk::Blocked { listeners, .. },
            ) => {
                let cell = DeferredValue::new();
                listeners.push(Listener::Bridge(cell.clone()));
                slot.fill(Value::Deferred(cell));
                return Ok(());
            }
            None => {
                let cell = DeferredValue::new();
                state
                    .chunks
                    .insert(key, Chunk::Pending(vec![Listener::Bridge(cell.clone())]));
                slot.fill(Value::Deferred(cell));
                return Ok(());
            }
        };
        match needs_init {
            NeedsInit::Model => state.initialize_model_chunk(key),
            NeedsInit::Module => state.initialize_module_chunk(key),
        }
    }
}

/// Applies a reference-site transform to a resolved chunk value.
pub(crate) fn apply_shape(shape: Shape, value: &Value) -> Result<Value, Arc<ErrorValue>> {
    match shape {
        Shape::Model => Ok(value.clone()),
        Shape::MapEntries => {
            let list = value
                .as_array()
                .ok_or_else(|| format_err("map reference must point at an entry array"))?;
            let entries = SharedEntries::new();
            for entry in list.snapshot() {
                let pair = entry
                    .as_array()
                    .filter(|p| p.len() == 2)
                    .ok_or_else(|| format_err("map entries must be [key, value] pairs"))?;
                entries.push(
                    pair.get(0).unwrap_or(Value::Null),
                    pair.get(1).unwrap_or(Value::Null),
                );
            }
            Ok(Value::Map(entries))
        }
        Shape::SetEntries => {
            let list = value
                .as_array()
                .ok_or_else(|| format_err("set reference must point at an element array"))?;
            Ok(Value::Set(SharedList::from_vec(list.snapshot())))
        }
        Shape::Blob => {
            let list = value
                .as_array()
                .ok_or_else(|| format_err("blob reference must point at [mimeType, bytes...]"))?;
            let parts = list.snapshot();
            let mime = parts
                .first()
                .and_then(|m| m.as_str().map(str::to_owned))
                .ok_or_else(|| format_err("blob descriptor is missing a mime type"))?;
            let mut data = Vec::new();
            for part in &parts[1..] {
                match part {
                    Value::Binary(binary) => data.extend_from_slice(binary.data()),
                    _ => return Err(format_err("blob parts must be binary rows")),
                }
            }
            Ok(Value::Blob(Arc::new(BlobValue { mime, data })))
        }
        Shape::FormData => {
            let list = value
                .as_array()
                .ok_or_else(|| format_err("form reference must point at an entry array"))?;
            let mut form = FormPayload::new();
            for entry in list.snapshot() {
                let pair = entry
                    .as_array()
                    .filter(|p| p.len() == 2)
                    .ok_or_else(|| format_err("form entries must be [name, value] pairs"))?;
                let name = pair
                    .get(0)
                    .and_then(|n| n.as_str().map(str::to_owned))
                    .ok_or_else(|| format_err("form entry names must be strings"))?;
                let field = match pair.get(1).unwrap_or(Value::Null) {
                    Value::String(text) => FormEntry::Text(text.to_string()),
                    Value::Binary(binary) => FormEntry::Bytes(binary.data().to_vec(), None),
                    Value::Blob(blob) => {
                        FormEntry::Bytes(blob.data.clone(), Some(blob.mime.clone()))
                    }
                    _ => return Err(format_err("form entry values must be text or bytes")),
                };
                form.append(name, field);
            }
            Ok(Value::Form(Arc::new(form)))
        }
        Shape::ErrorValue => {
            let message = value
                .get("message")
                .and_then(|m| m.as_str().map(str::to_owned))
                .unwrap_or_default();
            let mut error = ErrorValue::new(message);
            if let Some(stack) = value.get("stack").and_then(|s| s.as_str().map(str::to_owned)) {
                error = error.with_stack(stack);
            }
            if let Some(digest) = value.get("digest").and_then(|d| d.as_str().map(str::to_owned)) {
                if !digest.is_empty() {
                    error = error.with_digest(digest);
                }
            }
            Ok(Value::Error(Arc::new(error)))
        }
        Shape::ServerRef => {
            let id = value
                .get("id")
                .and_then(|i| i.as_str().map(str::to_owned))
                .ok_or_else(|| format_err("server reference descriptor is missing an id"))?;
            let mut reference = ServerReference::new(id);
            match value.get("bound") {
                None | Some(Value::Null) => {}
                Some(bound) => reference = reference.with_bound(bound),
            }
            Ok(Value::ServerRef(Arc::new(reference)))
        }
    }
}

/// Converts plain JSON (no reference tokens) into a value. Used for
/// payloads that are defined to carry data only, like hints.
pub(crate) fn json_to_plain(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => json_number(n),
        serde_json::Value::String(s) => Value::from(s.as_str()),
        serde_json::Value::Array(items) => {
            Value::Array(SharedList::from_vec(items.iter().map(json_to_plain).collect()))
        }
        serde_json::Value::Object(fields) => {
            let record = SharedRecord::new();
            for (key, field) in fields {
                record.insert(Arc::from(key.as_str()), json_to_plain(field));
            }
            Value::Object(record)
        }
    }
}
