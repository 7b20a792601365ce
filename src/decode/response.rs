//! Incremental decoding session.
//!
//! A [`Response`] consumes wire bytes in arbitrary slices, cuts them into
//! rows with a resumable parser, and resolves each row into the chunk
//! graph. Reads are non-blocking: a chunk that waits on rows still in
//! transit reports [`ChunkRead::Pending`] and becomes ready once its
//! dependencies land.
//!
//! Rows may arrive in any order. References to rows that have not arrived
//! park listeners on placeholder cells; when the row lands, a delivery
//! wave fills every waiting slot and unblocks dependent rows iteratively,
//! so deep dependency chains cannot recurse unboundedly.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::decode::chunk::{Chunk, ChunkKey, ChunkRead, Listener, Slot};
use crate::decode::reviver::{self, InitContext};
use crate::error::{Result, RowcodeError};
use crate::format::{
    self, BinaryKind, ErrorRowPayload, PostponeRowPayload, RowId, TagClass, CONNECTION_CLOSED,
};
use crate::modules::{ImportMetadata, ModuleLoader, TemporaryReferenceSet};
use crate::rt::{Mailbox, StreamKind, StreamValue, Waker};
use crate::value::{Binary, ErrorValue, SharedCell, Value};

/// Stand-in message for errors whose details stayed on the sending side.
const OMITTED_ERROR_MESSAGE: &str = "An error occurred on the remote side. \
     The message was omitted from the wire; use the digest to find the \
     original in the sender's logs.";

// --- OPTIONS ---

/// Knobs for a decoding session.
#[derive(Default)]
pub struct DecodeOptions {
    /// Host bundler integration for import rows. Without it, import rows
    /// fail to resolve.
    pub loader: Option<Arc<dyn ModuleLoader + Send + Sync>>,
    /// Called for every hint row, with the hint code and its payload.
    pub on_hint: Option<Box<dyn FnMut(u8, Value) + Send>>,
    /// Resolves temporary reference tokens back to registered values.
    pub temporary_references: Option<TemporaryReferenceSet>,
    /// Field-name prefix for form transports. Must match the encoder's.
    pub identifier_prefix: Option<String>,
}

impl fmt::Debug for DecodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeOptions")
            .field("loader", &self.loader.is_some())
            .field("on_hint", &self.on_hint.is_some())
            .field("temporary_references", &self.temporary_references.is_some())
            .field("identifier_prefix", &self.identifier_prefix)
            .finish()
    }
}

// --- ROW PARSER ---

/// A complete row cut out of the byte stream.
#[derive(Debug)]
pub(crate) struct RawRow {
    pub(crate) id: RowId,
    /// Row tag byte; `0` for untagged model rows.
    pub(crate) tag: u8,
    pub(crate) payload: Vec<u8>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ParseStage {
    /// Accumulating the hex row id.
    #[default]
    Id,
    /// At the byte after `:`, deciding how the payload is delimited.
    Tag,
    /// Accumulating the hex byte length of a binary payload.
    Length,
    /// Scanning for the terminating newline.
    Line,
    /// Consuming exactly `length` payload bytes.
    Body,
}

/// Resumable row cutter. Keeps partial state between `feed` calls so rows
/// can be split at any byte boundary by the transport.
#[derive(Debug, Default)]
struct RowParser {
    stage: ParseStage,
    id: u32,
    tag: u8,
    length: usize,
    buf: Vec<u8>,
}

impl RowParser {
    fn feed(&mut self, bytes: &[u8], rows: &mut Vec<RawRow>) -> Result<()> {
        let mut i = 0;
        while i < bytes.len() {
            match self.stage {
                ParseStage::Id => {
                    let b = bytes[i];
                    i += 1;
                    if b == b':' {
                        self.stage = ParseStage::Tag;
                    } else {
                        if self.id >> 28 != 0 {
                            return Err(RowcodeError::Format("row id overflows 32 bits".into()));
                        }
                        self.id = (self.id << 4) | format::hex_nibble(b)?;
                    }
                }
                ParseStage::Tag => {
                    let b = bytes[i];
                    match format::classify_tag(b) {
                        TagClass::LengthDelimited => {
                            self.tag = b;
                            self.stage = ParseStage::Length;
                            i += 1;
                        }
                        TagClass::NewlineDelimited => {
                            self.tag = b;
                            self.stage = ParseStage::Line;
                            i += 1;
                        }
                        TagClass::Payload => {
                            // Untagged model row; the byte belongs to the
                            // payload and is not consumed here.
                            self.tag = 0;
                            self.stage = ParseStage::Line;
                        }
                    }
                }
                ParseStage::Length => {
                    let b = bytes[i];
                    i += 1;
                    if b == b',' {
                        self.stage = ParseStage::Body;
                        if self.length == 0 {
                            self.emit(rows);
                        }
                    } else {
                        if self.length >> (usize::BITS - 4) != 0 {
                            return Err(RowcodeError::Format("row length overflows".into()));
                        }
                        self.length = (self.length << 4) | format::hex_nibble(b)? as usize;
                    }
                }
                ParseStage::Line => match bytes[i..].iter().position(|&b| b == b'\n') {
                    Some(offset) => {
                        self.buf.extend_from_slice(&bytes[i..i + offset]);
                        i += offset + 1;
                        self.emit(rows);
                    }
                    None => {
                        self.buf.extend_from_slice(&bytes[i..]);
                        i = bytes.len();
                    }
                },
                ParseStage::Body => {
                    let take = self.length.min(bytes.len() - i);
                    self.buf.extend_from_slice(&bytes[i..i + take]);
                    self.length -= take;
                    i += take;
                    if self.length == 0 {
                        self.emit(rows);
                    }
                }
            }
        }
        Ok(())
    }

    fn emit(&mut self, rows: &mut Vec<RawRow>) {
        rows.push(RawRow {
            id: RowId(self.id),
            tag: self.tag,
            payload: std::mem::take(&mut self.buf),
        });
        self.id = 0;
        self.tag = 0;
        self.length = 0;
        self.stage = ParseStage::Id;
    }
}

// --- STREAM STAGING ---

#[derive(Debug)]
enum Staged {
    /// A value item waiting on its backing cell.
    Item(ChunkKey),
    /// The closing value of an iterable.
    Final(ChunkKey),
    /// A bare close.
    Close,
}

#[derive(Debug)]
struct StreamSlot {
    value: StreamValue,
    /// Items in arrival order; the head is released only once resolved,
    /// so out-of-order resolution cannot reorder delivery.
    staged: VecDeque<Staged>,
    /// Set once a close or error row arrived; later rows are dropped.
    done: bool,
}

// --- SESSION STATE ---

pub(crate) struct ResponseState {
    pub(crate) chunks: HashMap<ChunkKey, Chunk>,
    pub(crate) options: DecodeOptions,
    streams: HashMap<RowId, StreamSlot>,
    debug_rows: HashMap<RowId, Vec<Value>>,
    /// Settled cells whose listeners have not been notified yet.
    ready: VecDeque<(ChunkKey, Vec<Listener>)>,
    mailbox: Arc<Mailbox>,
    next_internal: u32,
}

impl ResponseState {
    fn new(options: DecodeOptions) -> Self {
        Self {
            chunks: HashMap::new(),
            options,
            streams: HashMap::new(),
            debug_rows: HashMap::new(),
            ready: VecDeque::new(),
            mailbox: Mailbox::new(),
            next_internal: 0,
        }
    }

    fn alloc_internal(&mut self) -> ChunkKey {
        let key = ChunkKey::Internal(self.next_internal);
        self.next_internal += 1;
        key
    }

    // --- CHUNK TRANSITIONS ---

    /// Parses and walks a `ResolvedModel` cell.
    ///
    /// The cell is swapped to `Blocked` before the walk so that re-entrant
    /// references (cycles through other rows) park a listener instead of
    /// recursing forever; a cross-row cycle therefore never resolves and
    /// is surfaced when the session closes.
    pub(crate) fn initialize_model_chunk(&mut self, key: ChunkKey) {
        let holder = SharedCell::empty();
        let payload = match self.chunks.get_mut(&key) {
            Some(slot) => {
                let previous = std::mem::replace(
                    slot,
                    Chunk::Blocked {
                        listeners: Vec::new(),
                        deps: 0,
                        holder: holder.clone(),
                        fixups: Vec::new(),
                    },
                );
                match previous {
                    Chunk::ResolvedModel(payload) => payload,
                    other => {
                        *slot = other;
                        return;
                    }
                }
            }
            None => return,
        };

        let json: serde_json::Value = match serde_json::from_slice(&payload) {
            Ok(json) => json,
            Err(error) => {
                self.reject_chunk(key, Arc::new(ErrorValue::from(RowcodeError::from(error))));
                return;
            }
        };

        let mut ctx = InitContext::new(key);
        if let Err(error) = reviver::revive(self, &mut ctx, &json, Slot::CellSet(holder)) {
            self.reject_chunk(key, error);
            return;
        }

        // Fold the walk results into the cell; listeners may have attached
        // to it while the walk ran.
        if let Some(Chunk::Blocked { deps, fixups, .. }) = self.chunks.get_mut(&key) {
            *deps = ctx.deps;
            *fixups = ctx.fixups;
        }
        if ctx.deps == 0 {
            self.complete_chunk(key);
        }
    }

    /// Kicks off module loading for a `ResolvedModule` cell.
    pub(crate) fn initialize_module_chunk(&mut self, key: ChunkKey) {
        let metadata = match self.chunks.get_mut(&key) {
            Some(slot) => {
                let previous = std::mem::replace(slot, Chunk::Pending(Vec::new()));
                match previous {
                    Chunk::ResolvedModule(metadata) => metadata,
                    other => {
                        *slot = other;
                        return;
                    }
                }
            }
            None => return,
        };

        let loader = match &self.options.loader {
            Some(loader) => Arc::clone(loader),
            None => {
                self.reject_chunk(
                    key,
                    Arc::new(ErrorValue::from(RowcodeError::Resolve(
                        "no module loader configured for import rows".into(),
                    ))),
                );
                return;
            }
        };

        match loader.preload(&metadata) {
            Some(pending) => {
                let listeners = match self.chunks.get_mut(&key) {
                    Some(Chunk::Pending(listeners)) => std::mem::take(listeners),
                    _ => Vec::new(),
                };
                self.chunks
                    .insert(key, Chunk::PreloadingModule { listeners, metadata });
                pending.subscribe(Waker::new(&self.mailbox, key.token()));
            }
            None => self.require_module(key, Vec::new(), &metadata),
        }
    }

    fn require_module(&mut self, key: ChunkKey, listeners: Vec<Listener>, meta: &ImportMetadata) {
        let loader = match &self.options.loader {
            Some(loader) => Arc::clone(loader),
            None => return,
        };
        match loader.require(meta) {
            Ok(value) => {
                self.chunks.insert(key, Chunk::Fulfilled(value));
                self.ready.push_back((key, listeners));
            }
            Err(error) => {
                self.chunks
                    .insert(key, Chunk::Rejected(Arc::new(ErrorValue::from(error))));
                self.ready.push_back((key, listeners));
            }
        }
    }

    /// Completes a `Blocked` cell whose dependency count reached zero.
    fn complete_chunk(&mut self, key: ChunkKey) {
        let (listeners, holder, fixups) = match self.chunks.get_mut(&key) {
            Some(slot) => {
                let previous = std::mem::replace(slot, Chunk::Pending(Vec::new()));
                match previous {
                    Chunk::Blocked {
                        listeners,
                        holder,
                        fixups,
                        ..
                    } => (listeners, holder, fixups),
                    other => {
                        *slot = other;
                        return;
                    }
                }
            }
            None => return,
        };

        let value = holder.get();
        let mut failure = None;
        for (slot, shape) in fixups {
            match reviver::apply_shape(shape, &value) {
                Ok(shaped) => slot.fill(shaped),
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }
        match failure {
            Some(error) => {
                self.chunks.insert(key, Chunk::Rejected(error));
            }
            None => {
                self.chunks.insert(key, Chunk::Fulfilled(value));
            }
        }
        self.ready.push_back((key, listeners));
    }

    fn reject_chunk(&mut self, key: ChunkKey, error: Arc<ErrorValue>) {
        let listeners = match self.chunks.get_mut(&key) {
            Some(slot) => {
                if slot.is_settled() {
                    return;
                }
                let listeners = slot.take_listeners();
                *slot = Chunk::Rejected(error);
                listeners
            }
            None => {
                self.chunks.insert(key, Chunk::Rejected(error));
                Vec::new()
            }
        };
        self.ready.push_back((key, listeners));
    }

    fn fulfill_direct(&mut self, key: ChunkKey, value: Value) {
        let listeners = match self.chunks.get_mut(&key) {
            None => Vec::new(),
            Some(Chunk::Pending(listeners)) => std::mem::take(listeners),
            // A row already arrived under this id; first write wins.
            Some(_) => return,
        };
        self.chunks.insert(key, Chunk::Fulfilled(value));
        self.ready.push_back((key, listeners));
    }

    /// Re-parks listeners taken before a lazy initialization, or schedules
    /// them if the cell settled during it.
    fn park_or_deliver(&mut self, key: ChunkKey, listeners: Vec<Listener>) {
        if listeners.is_empty() {
            return;
        }
        match self.chunks.get_mut(&key) {
            Some(
                Chunk::Pending(parked)
                | Chunk::PreloadingModule { listeners: parked, .. }
                | Chunk::Blocked { listeners: parked, .. },
            ) => parked.extend(listeners),
            _ => self.ready.push_back((key, listeners)),
        }
    }

    // --- DELIVERY ---

    /// Notifies listeners of settled cells until the queue drains, then
    /// releases any stream items that resolved along the way.
    fn run_waves(&mut self) {
        while let Some((key, listeners)) = self.ready.pop_front() {
            let outcome: std::result::Result<Value, Arc<ErrorValue>> =
                match self.chunks.get(&key) {
                    Some(Chunk::Fulfilled(value)) => Ok(value.clone()),
                    Some(Chunk::Rejected(error)) => Err(Arc::clone(error)),
                    _ => continue,
                };
            for listener in listeners {
                self.deliver(listener, &outcome);
            }
        }
        self.pump_streams();
    }

    fn deliver(&mut self, listener: Listener, outcome: &std::result::Result<Value, Arc<ErrorValue>>) {
        match listener {
            Listener::Slot { slot, shape, blocked } => match outcome {
                Ok(value) => match reviver::apply_shape(shape, value) {
                    Ok(shaped) => {
                        slot.fill(shaped);
                        self.unblock(blocked);
                    }
                    Err(error) => self.reject_chunk(blocked, error),
                },
                Err(error) => self.reject_chunk(blocked, Arc::clone(error)),
            },
            Listener::Bridge(cell) => match outcome {
                Ok(value) => {
                    cell.fulfill(value.clone());
                }
                Err(error) => {
                    cell.reject(error.as_ref().clone());
                }
            },
            Listener::Debug { target } => {
                if let Ok(value) = outcome {
                    self.debug_rows.entry(target).or_default().push(value.clone());
                }
            }
            Listener::Console => {
                if let Ok(value) = outcome {
                    replay_console(value);
                }
            }
        }
    }

    fn unblock(&mut self, key: ChunkKey) {
        let completed = match self.chunks.get_mut(&key) {
            Some(Chunk::Blocked { deps, .. }) => {
                *deps -= 1;
                *deps == 0
            }
            _ => false,
        };
        if completed {
            self.complete_chunk(key);
        }
    }

    /// Drains module loads that settled since the last pump.
    fn pump(&mut self) {
        for token in self.mailbox.drain() {
            let key = ChunkKey::from_token(token);
            let taken = match self.chunks.get_mut(&key) {
                Some(slot @ Chunk::PreloadingModule { .. }) => {
                    match std::mem::replace(slot, Chunk::Pending(Vec::new())) {
                        Chunk::PreloadingModule { listeners, metadata } => {
                            Some((listeners, metadata))
                        }
                        other => {
                            *slot = other;
                            None
                        }
                    }
                }
                _ => None,
            };
            if let Some((listeners, metadata)) = taken {
                self.require_module(key, listeners, &metadata);
            }
        }
        self.run_waves();
    }

    // --- STREAMS ---

    /// Releases resolved items from every live stream, in arrival order.
    fn pump_streams(&mut self) {
        let ids: Vec<RowId> = self.streams.keys().copied().collect();
        for id in ids {
            let mut finished = false;
            loop {
                let slot = match self.streams.get_mut(&id) {
                    Some(slot) => slot,
                    None => break,
                };
                let action = match slot.staged.front() {
                    None => break,
                    Some(Staged::Close) => StageAction::Close,
                    Some(Staged::Item(key) | Staged::Final(key)) => {
                        let is_final = matches!(slot.staged.front(), Some(Staged::Final(_)));
                        match self.chunks.get(key) {
                            Some(Chunk::Fulfilled(value)) => StageAction::Deliver {
                                key: *key,
                                value: value.clone(),
                                is_final,
                            },
                            Some(Chunk::Rejected(error)) => StageAction::Fail {
                                key: *key,
                                error: Arc::clone(error),
                            },
                            _ => break,
                        }
                    }
                };
                let slot = match self.streams.get_mut(&id) {
                    Some(slot) => slot,
                    None => break,
                };
                match action {
                    StageAction::Close => {
                        slot.staged.pop_front();
                        slot.value.close();
                        finished = true;
                        break;
                    }
                    StageAction::Deliver { key, value, is_final } => {
                        slot.staged.pop_front();
                        if is_final {
                            slot.value.close_with(value);
                            finished = true;
                        } else {
                            slot.value.push(value);
                        }
                        self.chunks.remove(&key);
                        if finished {
                            break;
                        }
                    }
                    StageAction::Fail { key, error } => {
                        slot.staged.pop_front();
                        slot.value.fail(error.as_ref().clone());
                        self.chunks.remove(&key);
                        finished = true;
                        break;
                    }
                }
            }
            if finished {
                self.streams.remove(&id);
            }
        }
    }

    fn start_stream(&mut self, id: RowId, kind: StreamKind) {
        let key = ChunkKey::Wire(id);
        if matches!(self.chunks.get(&key), Some(chunk) if chunk.is_settled()) {
            return;
        }
        let stream = match kind {
            StreamKind::Readable => StreamValue::readable(),
            StreamKind::ReadableBytes => StreamValue::readable_bytes(),
            StreamKind::AsyncIterable => StreamValue::async_iterable(),
            StreamKind::AsyncIterator => StreamValue::async_iterator(),
        };
        self.streams.insert(
            id,
            StreamSlot {
                value: stream.clone(),
                staged: VecDeque::new(),
                done: false,
            },
        );
        self.fulfill_direct(key, Value::Stream(stream));
    }

    /// Stages a model-row item on a live stream.
    fn stage_stream_item(&mut self, id: RowId, payload: Vec<u8>, is_final: bool) {
        if self.streams.get(&id).map_or(true, |slot| slot.done) {
            log::debug!("dropping stream row {} after its close", id);
            return;
        }
        let key = self.alloc_internal();
        self.chunks.insert(key, Chunk::ResolvedModel(payload));
        self.initialize_model_chunk(key);
        if let Some(slot) = self.streams.get_mut(&id) {
            if is_final {
                slot.done = true;
                slot.staged.push_back(Staged::Final(key));
            } else {
                slot.staged.push_back(Staged::Item(key));
            }
        }
    }

    /// Stages an already-materialized item (text and binary rows).
    fn stage_stream_value(&mut self, id: RowId, value: Value) {
        if self.streams.get(&id).map_or(true, |slot| slot.done) {
            log::debug!("dropping stream row {} after its close", id);
            return;
        }
        let key = self.alloc_internal();
        self.chunks.insert(key, Chunk::Fulfilled(value));
        if let Some(slot) = self.streams.get_mut(&id) {
            slot.staged.push_back(Staged::Item(key));
        }
    }

    fn close_stream(&mut self, id: RowId, payload: Vec<u8>) {
        if payload.is_empty() {
            if let Some(slot) = self.streams.get_mut(&id) {
                if !slot.done {
                    slot.done = true;
                    slot.staged.push_back(Staged::Close);
                }
            }
        } else {
            self.stage_stream_item(id, payload, true);
        }
    }

    fn fail_stream(&mut self, id: RowId, error: &ErrorValue) -> bool {
        match self.streams.remove(&id) {
            Some(slot) => {
                slot.value.fail(error.clone());
                for staged in slot.staged {
                    if let Staged::Item(key) | Staged::Final(key) = staged {
                        self.chunks.remove(&key);
                    }
                }
                true
            }
            None => false,
        }
    }

    // --- ROW DISPATCH ---

    fn process_row(&mut self, row: RawRow) {
        let RawRow { id, tag, payload } = row;
        match tag {
            0 => self.resolve_model(id, payload),
            b'T' => self.resolve_text(id, payload),
            b'I' => self.resolve_module(id, payload),
            b'H' => self.resolve_hint(payload),
            b'E' => self.resolve_error(id, payload),
            b'P' => self.resolve_postpone(id, payload),
            b'D' => self.attach_side_row(id, payload, Listener::Debug { target: id }),
            b'W' => self.attach_side_row(id, payload, Listener::Console),
            b'R' => self.start_stream(id, StreamKind::Readable),
            b'r' => self.start_stream(id, StreamKind::ReadableBytes),
            b'X' => self.start_stream(id, StreamKind::AsyncIterable),
            b'x' => self.start_stream(id, StreamKind::AsyncIterator),
            b'C' => self.close_stream(id, payload),
            other => match BinaryKind::from_row_tag(other) {
                Some(kind) => self.resolve_binary(id, kind, payload),
                // Unknown tags carry models; tolerated for forward
                // compatibility with newer senders.
                None => self.resolve_model(id, payload),
            },
        }
    }

    fn resolve_model(&mut self, id: RowId, payload: Vec<u8>) {
        if self.streams.contains_key(&id) {
            self.stage_stream_item(id, payload, false);
            return;
        }
        let key = ChunkKey::Wire(id);
        let listeners = match self.chunks.get_mut(&key) {
            None => {
                self.chunks.insert(key, Chunk::ResolvedModel(payload));
                return;
            }
            Some(Chunk::Pending(listeners)) => std::mem::take(listeners),
            // Duplicate row; first write wins.
            Some(_) => return,
        };
        self.chunks.insert(key, Chunk::ResolvedModel(payload));
        if listeners.is_empty() {
            return;
        }
        self.initialize_model_chunk(key);
        self.park_or_deliver(key, listeners);
    }

    fn resolve_text(&mut self, id: RowId, payload: Vec<u8>) {
        let value = match String::from_utf8(payload) {
            Ok(text) => Value::from(text),
            Err(_) => {
                let error = Arc::new(ErrorValue::from(RowcodeError::Format(
                    "text row is not valid UTF-8".into(),
                )));
                if !self.fail_stream(id, &error) {
                    self.reject_chunk(ChunkKey::Wire(id), error);
                }
                return;
            }
        };
        if self.streams.contains_key(&id) {
            self.stage_stream_value(id, value);
        } else {
            self.fulfill_direct(ChunkKey::Wire(id), value);
        }
    }

    fn resolve_binary(&mut self, id: RowId, kind: BinaryKind, payload: Vec<u8>) {
        if payload.len() % kind.element_width() != 0 {
            let error = Arc::new(ErrorValue::from(RowcodeError::Format(format!(
                "binary row {} is not a whole number of {}-byte elements",
                id,
                kind.element_width(),
            ))));
            if !self.fail_stream(id, &error) {
                self.reject_chunk(ChunkKey::Wire(id), error);
            }
            return;
        }
        let value = Value::Binary(Binary::from_shared(kind, payload.into()));
        if self.streams.contains_key(&id) {
            self.stage_stream_value(id, value);
        } else {
            self.fulfill_direct(ChunkKey::Wire(id), value);
        }
    }

    fn resolve_module(&mut self, id: RowId, payload: Vec<u8>) {
        let key = ChunkKey::Wire(id);
        let metadata = serde_json::from_slice::<serde_json::Value>(&payload)
            .map_err(RowcodeError::from)
            .and_then(|json| ImportMetadata::from_json(&json));
        let metadata = match metadata {
            Ok(metadata) => metadata,
            Err(error) => {
                self.reject_chunk(key, Arc::new(ErrorValue::from(error)));
                return;
            }
        };
        let listeners = match self.chunks.get_mut(&key) {
            None => {
                self.chunks.insert(key, Chunk::ResolvedModule(metadata));
                return;
            }
            Some(Chunk::Pending(listeners)) => std::mem::take(listeners),
            Some(_) => return,
        };
        self.chunks.insert(key, Chunk::ResolvedModule(metadata));
        if listeners.is_empty() {
            return;
        }
        self.initialize_module_chunk(key);
        self.park_or_deliver(key, listeners);
    }

    fn resolve_hint(&mut self, payload: Vec<u8>) {
        let Some((&code, body)) = payload.split_first() else {
            log::warn!("ignoring empty hint row");
            return;
        };
        let json: serde_json::Value = match serde_json::from_slice(body) {
            Ok(json) => json,
            Err(error) => {
                log::warn!("ignoring malformed hint row: {error}");
                return;
            }
        };
        let value = reviver::json_to_plain(&json);
        if let Some(on_hint) = self.options.on_hint.as_mut() {
            on_hint(code, value);
        }
    }

    fn resolve_error(&mut self, id: RowId, payload: Vec<u8>) {
        let parsed: ErrorRowPayload = serde_json::from_slice(&payload).unwrap_or_default();
        let mut error = if parsed.message.is_empty() {
            ErrorValue::new(OMITTED_ERROR_MESSAGE)
        } else {
            ErrorValue::new(parsed.message)
        };
        if let Some(stack) = parsed.stack {
            error = error.with_stack(stack);
        }
        if !parsed.digest.is_empty() {
            error = error.with_digest(parsed.digest);
        }
        if !self.fail_stream(id, &error) {
            self.reject_chunk(ChunkKey::Wire(id), Arc::new(error));
        }
    }

    fn resolve_postpone(&mut self, id: RowId, payload: Vec<u8>) {
        let parsed: PostponeRowPayload = if payload.is_empty() {
            PostponeRowPayload::default()
        } else {
            serde_json::from_slice(&payload).unwrap_or_default()
        };
        let mut error = ErrorValue::postpone(parsed.reason);
        if let Some(stack) = parsed.stack {
            error = error.with_stack(stack);
        }
        if !self.fail_stream(id, &error) {
            self.reject_chunk(ChunkKey::Wire(id), Arc::new(error));
        }
    }

    /// Revives a side-channel payload (debug info, console replay) on an
    /// internal cell with the given listener already attached.
    fn attach_side_row(&mut self, id: RowId, payload: Vec<u8>, listener: Listener) {
        let _ = id;
        let key = self.alloc_internal();
        self.chunks.insert(key, Chunk::ResolvedModel(payload));
        self.initialize_model_chunk(key);
        self.park_or_deliver(key, vec![listener]);
    }
}

/// Replays a console row through the log facade.
fn replay_console(value: &Value) {
    let Some(entry) = value.as_array() else {
        return;
    };
    let parts = entry.snapshot();
    let method = parts.first().and_then(|m| m.as_str().map(str::to_owned));
    let args = &parts[1.min(parts.len())..];
    let rendered = args
        .iter()
        .map(|arg| match arg {
            Value::String(text) => text.to_string(),
            other => format!("{other:?}"),
        })
        .collect::<Vec<_>>()
        .join(" ");
    match method.as_deref() {
        Some("error") => log::error!("[remote console] {rendered}"),
        Some("warn") => log::warn!("[remote console] {rendered}"),
        _ => log::debug!("[remote console] {rendered}"),
    }
}

// --- PUBLIC SESSION ---

/// Decode side of one session.
///
/// Bytes go in through [`push`](Response::push); values come out through
/// [`read`](Response::read) once their rows resolve. The session must be
/// [`close`](Response::close)d when the transport ends so that chunks
/// still waiting on missing rows fail instead of hanging forever.
#[derive(Debug)]
pub struct Response {
    state: ResponseState,
    parser: RowParser,
    closed: bool,
}

impl fmt::Debug for ResponseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseState")
            .field("chunks", &self.chunks.len())
            .field("streams", &self.streams.len())
            .field("ready", &self.ready.len())
            .finish()
    }
}

impl Response {
    /// A session with the given options.
    pub fn new(options: DecodeOptions) -> Self {
        Self {
            state: ResponseState::new(options),
            parser: RowParser::default(),
            closed: false,
        }
    }

    /// Feeds transport bytes. Slice boundaries are arbitrary; rows split
    /// across calls are reassembled.
    ///
    /// Framing errors are fatal: the session closes and every unresolved
    /// chunk rejects.
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(RowcodeError::Closed(
                "cannot push bytes into a closed session".into(),
            ));
        }
        self.state.pump();
        let mut rows = Vec::new();
        if let Err(error) = self.parser.feed(bytes, &mut rows) {
            for row in rows {
                self.state.process_row(row);
            }
            self.finish(Arc::new(ErrorValue::from(error.clone())));
            return Err(error);
        }
        for row in rows {
            self.state.process_row(row);
        }
        self.state.run_waves();
        Ok(())
    }

    /// Marks the transport finished. Chunks still waiting on rows reject
    /// with a connection-closed error; settled chunks stay readable.
    pub fn close(&mut self) {
        if !self.closed {
            self.finish(Arc::new(ErrorValue::new(CONNECTION_CLOSED)));
        }
    }

    /// Like [`close`](Response::close), with an explicit failure reason.
    pub fn close_with_error(&mut self, reason: ErrorValue) {
        if !self.closed {
            self.finish(Arc::new(reason));
        }
    }

    fn finish(&mut self, error: Arc<ErrorValue>) {
        self.closed = true;
        self.state.pump();
        let unresolved: Vec<ChunkKey> = self
            .state
            .chunks
            .iter()
            .filter(|(_, chunk)| {
                matches!(
                    chunk,
                    Chunk::Pending(_) | Chunk::Blocked { .. } | Chunk::PreloadingModule { .. }
                )
            })
            .map(|(key, _)| *key)
            .collect();
        for key in unresolved {
            self.state.reject_chunk(key, Arc::clone(&error));
        }
        let ids: Vec<RowId> = self.state.streams.keys().copied().collect();
        for id in ids {
            self.state.fail_stream(id, &error);
        }
        self.state.run_waves();
    }

    /// Reads the chunk behind one row id.
    ///
    /// Triggers lazy parsing and module loading as needed. Reading an id
    /// no row has arrived for yet registers interest and reports
    /// [`ChunkRead::Pending`].
    pub fn read(&mut self, id: RowId) -> ChunkRead {
        self.state.pump();
        let key = ChunkKey::Wire(id);
        loop {
            enum Step {
                Model,
                Module,
            }
            let step = match self.state.chunks.get(&key) {
                Some(Chunk::Fulfilled(value)) => return ChunkRead::Ready(value.clone()),
                Some(Chunk::Rejected(error)) => return ChunkRead::Failed(Arc::clone(error)),
                Some(Chunk::ResolvedModel(_)) => Step::Model,
                Some(Chunk::ResolvedModule(_)) => Step::Module,
                Some(_) => return ChunkRead::Pending,
                None => {
                    if self.closed {
                        return ChunkRead::Failed(Arc::new(ErrorValue::new(CONNECTION_CLOSED)));
                    }
                    self.state.chunks.insert(key, Chunk::Pending(Vec::new()));
                    return ChunkRead::Pending;
                }
            };
            match step {
                Step::Model => self.state.initialize_model_chunk(key),
                Step::Module => self.state.initialize_module_chunk(key),
            }
            self.state.run_waves();
        }
    }

    /// Reads the root chunk (row `0`).
    pub fn read_root(&mut self) -> ChunkRead {
        self.read(RowId::ROOT)
    }

    /// Debug info rows attached to `id`, in arrival order.
    pub fn debug_info(&self, id: RowId) -> Option<&[Value]> {
        self.state.debug_rows.get(&id).map(Vec::as_slice)
    }

    /// True once the session saw its end of transport.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn inject_row(&mut self, row: RawRow) {
        self.state.process_row(row);
    }

    pub(crate) fn settle(&mut self) {
        self.state.run_waves();
    }
}

enum StageAction {
    Close,
    Deliver {
        key: ChunkKey,
        value: Value,
        is_final: bool,
    },
    Fail {
        key: ChunkKey,
        error: Arc<ErrorValue>,
    },
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn parse_all(bytes: &[u8]) -> Vec<RawRow> {
        let mut parser = RowParser::default();
        let mut rows = Vec::new();
        parser.feed(bytes, &mut rows).unwrap();
        rows
    }

    #[test]
    fn parser_cuts_model_and_tagged_rows() {
        let rows = parse_all(b"0:{\"a\":1}\n1:T3,abc2:E{\"digest\":\"d\"}\n");
        assert_eq!(rows.len(), 3);
        assert_eq!((rows[0].id, rows[0].tag), (RowId(0), 0));
        assert_eq!(rows[0].payload, b"{\"a\":1}");
        assert_eq!((rows[1].id, rows[1].tag), (RowId(1), b'T'));
        assert_eq!(rows[1].payload, b"abc");
        assert_eq!((rows[2].id, rows[2].tag), (RowId(2), b'E'));
    }

    #[test]
    fn parser_resumes_across_arbitrary_split_points() {
        let wire = b"1a:o4,\x01\x02\x03\x04b:\"hi\"\n";
        for split in 0..wire.len() {
            let mut parser = RowParser::default();
            let mut rows = Vec::new();
            parser.feed(&wire[..split], &mut rows).unwrap();
            parser.feed(&wire[split..], &mut rows).unwrap();
            assert_eq!(rows.len(), 2, "split at {split}");
            assert_eq!(rows[0].id, RowId(0x1a));
            assert_eq!(rows[0].payload, [1, 2, 3, 4]);
            assert_eq!(rows[1].id, RowId(0xb));
            assert_eq!(rows[1].payload, b"\"hi\"");
        }
    }

    #[test]
    fn parser_treats_binary_payload_bytes_opaquely() {
        // A payload byte equal to '\n' must not terminate a sized row.
        let rows = parse_all(b"3:o2,\n\n");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload, [10, 10]);
    }

    #[test]
    fn parser_rejects_invalid_hex_ids() {
        let mut parser = RowParser::default();
        let mut rows = Vec::new();
        assert!(parser.feed(b"G:1\n", &mut rows).is_err());
    }

    #[test]
    fn hint_rows_have_no_id() {
        let rows = parse_all(b":HL[\"/style.css\",\"style\"]\n");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tag, b'H');
        assert_eq!(rows[0].payload, b"L[\"/style.css\",\"style\"]");
    }
}
