//! Encode sessions.
//!
//! A [`Request`] owns one encoding from root value to final row. It keeps
//! a task per row whose value is still settling, four priority queues of
//! finished rows, and a mailbox that source cells ping when they settle.
//! [`Request::poll`] is the whole engine: run every woken task, then flush
//! queued rows into the caller's sink until the sink pushes back.
//!
//! Nothing here blocks. A poll that cannot make progress reports
//! [`Progress::AwaitingValues`] and returns; the caller decides whether to
//! wait, poll again, or [`Request::abort`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::encode::rows::{FormConsumer, RowBody, RowConsumer, SinkConsumer, WireRow};
use crate::encode::serializer::{self, render_model, ObjectRef};
use crate::error::{Result, RowcodeError};
use crate::format::{tag, ErrorRowPayload, PostponeRowPayload, RowId};
use crate::io::{RowSink, WriteFlow};
use crate::modules::{ModuleManifest, TemporaryReferenceSet};
use crate::rt::{AbortSignal, DeferredState, DeferredValue, Mailbox, StreamPoll, StreamValue, Waker};
use crate::taint::TaintRegistry;
use crate::value::{ErrorValue, FormPayload, Value, ValueId};

// --- OPTIONS ---

/// Configuration for an encode session.
#[derive(Default)]
pub struct EncodeOptions {
    /// Translates client reference keys into import metadata.
    pub manifest: Option<Arc<dyn ModuleManifest + Send + Sync>>,
    /// Called once per failure that crosses the wire; may return a digest
    /// to write in place of the default message hash.
    pub on_error: Option<Box<dyn FnMut(&ErrorValue) -> Option<String> + Send>>,
    /// Called with the reason of every postponed row.
    pub on_postpone: Option<Box<dyn FnMut(&str) + Send>>,
    /// Prefixed to form field names. The byte transport does not use it.
    pub identifier_prefix: Option<String>,
    /// Include messages and stacks in error rows. Off by default so
    /// internals do not leak to the receiving side.
    pub debug: bool,
    /// Values to round-trip by identity instead of serializing.
    pub temporary_references: Option<TemporaryReferenceSet>,
    /// Values and byte patterns that must never be written.
    pub taint: Option<TaintRegistry>,
    /// External cancellation. Checked at every poll.
    pub signal: Option<AbortSignal>,
}

impl fmt::Debug for EncodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodeOptions")
            .field("manifest", &self.manifest.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_postpone", &self.on_postpone.is_some())
            .field("identifier_prefix", &self.identifier_prefix)
            .field("debug", &self.debug)
            .field("temporary_references", &self.temporary_references.is_some())
            .field("taint", &self.taint.is_some())
            .field("signal", &self.signal.is_some())
            .finish()
    }
}

/// What a call to [`Request::poll`] accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Every row is written and the sink is closed. The session is over.
    Complete,
    /// All flushable rows are out, but some tasks wait on unsettled
    /// sources. Poll again once they settle.
    AwaitingValues,
    /// The sink refused more rows. Poll again when it has capacity.
    SinkFull,
}

/// Lifecycle state of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Accepting hints and aborts; polls make progress.
    Active,
    /// [`Request::abort`] was called. Queued rows still flush.
    Aborted,
    /// Every row is out and the sink is closed.
    Closed,
}

#[derive(Clone)]
enum Task {
    Model(DeferredValue),
    Stream(StreamValue),
}

// --- SHARED STATE ---

/// State threaded through the render walk.
///
/// Split from [`Request`] so the serializer can borrow all of it mutably
/// while task bookkeeping happens a level up.
pub(crate) struct RequestShared {
    pub(crate) manifest: Option<Arc<dyn ModuleManifest + Send + Sync>>,
    pub(crate) on_error: Option<Box<dyn FnMut(&ErrorValue) -> Option<String> + Send>>,
    pub(crate) on_postpone: Option<Box<dyn FnMut(&str) + Send>>,
    pub(crate) debug: bool,
    pub(crate) temporary_references: Option<TemporaryReferenceSet>,
    pub(crate) taint: Option<TaintRegistry>,
    pub(crate) signal: Option<AbortSignal>,
    /// Large strings get their own text row. Off for form transports,
    /// where a field already holds arbitrary length.
    pub(crate) text_outline: bool,

    next_id: u32,
    /// Dedup table from storage identity to row reference.
    pub(crate) written: HashMap<ValueId, ObjectRef>,
    /// Containers the current task reaches twice. Outlined on first
    /// sighting so every occurrence decodes to the same storage.
    pub(crate) repeats: HashSet<ValueId>,
    pub(crate) written_symbols: HashMap<Arc<str>, RowId>,
    pub(crate) written_refs: HashMap<String, RowId>,
    /// The value whose row is currently rendering. It renders inline
    /// exactly once even when the dedup table already names it.
    pub(crate) model_root: Option<ValueId>,

    pub(crate) import_queue: VecDeque<WireRow>,
    pub(crate) hint_queue: VecDeque<WireRow>,
    pub(crate) regular_queue: VecDeque<WireRow>,
    pub(crate) error_queue: VecDeque<WireRow>,

    tasks: HashMap<RowId, Task>,
    mailbox: Arc<Mailbox>,
}

impl RequestShared {
    pub(crate) fn alloc_id(&mut self) -> RowId {
        let id = RowId(self.next_id);
        self.next_id += 1;
        id
    }

    /// The digest written for a failure: the error hook's answer, the
    /// error's own digest, or a hash of the message.
    fn error_digest(&mut self, error: &ErrorValue) -> String {
        if let Some(hook) = self.on_error.as_mut() {
            if let Some(digest) = hook(error) {
                return digest;
            }
        }
        error
            .digest
            .clone()
            .unwrap_or_else(|| serializer::default_digest(&error.message))
    }

    fn error_row_json(&mut self, error: &ErrorValue) -> String {
        let payload = ErrorRowPayload {
            digest: self.error_digest(error),
            message: if self.debug {
                error.message.clone()
            } else {
                String::new()
            },
            stack: if self.debug { error.stack.clone() } else { None },
        };
        serde_json::to_string(&payload).unwrap_or_else(|_| String::from("{}"))
    }

    fn postpone_row_json(&mut self, error: &ErrorValue) -> String {
        if let Some(hook) = self.on_postpone.as_mut() {
            hook(&error.message);
        }
        if !self.debug {
            return String::new();
        }
        let payload = PostponeRowPayload {
            reason: error.message.clone(),
            stack: error.stack.clone(),
        };
        serde_json::to_string(&payload).unwrap_or_else(|_| String::from("{}"))
    }

    /// Queues a standalone error row and returns its id, for positions
    /// that recover by referencing a failure instead of raising one.
    pub(crate) fn emit_error_row(&mut self, error: &ErrorValue) -> RowId {
        let text = self.error_row_json(error);
        let id = self.alloc_id();
        self.error_queue.push_back(WireRow {
            id,
            body: RowBody::Tagged {
                tag: tag::ERROR,
                text,
            },
        });
        id
    }

    /// The failure row for one task id, postpones and errors alike.
    fn emit_failure_row(&mut self, id: RowId, error: &ErrorValue) {
        let (row_tag, text) = if error.is_postpone() {
            (tag::POSTPONE, self.postpone_row_json(error))
        } else {
            (tag::ERROR, self.error_row_json(error))
        };
        self.error_queue.push_back(WireRow {
            id,
            body: RowBody::Tagged { tag: row_tag, text },
        });
    }

    /// Registers a row whose payload waits on a deferred value.
    pub(crate) fn spawn_model_task(&mut self, id: RowId, source: DeferredValue) {
        source.subscribe(Waker::new(&self.mailbox, id.0));
        self.tasks.insert(id, Task::Model(source));
    }

    /// Registers a row fed incrementally by a stream.
    pub(crate) fn spawn_stream_task(&mut self, id: RowId, source: StreamValue) {
        source.subscribe(Waker::new(&self.mailbox, id.0));
        self.tasks.insert(id, Task::Stream(source));
    }

    fn queues_empty(&self) -> bool {
        self.import_queue.is_empty()
            && self.hint_queue.is_empty()
            && self.regular_queue.is_empty()
            && self.error_queue.is_empty()
    }
}

// --- REQUEST ---

/// One encoding session, from root value to closed sink.
pub struct Request {
    shared: RequestShared,
    status: RequestStatus,
    /// First unrecoverable failure. Poison: every later poll re-reports it.
    fatal: Option<RowcodeError>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("status", &self.status)
            .field("tasks", &self.shared.tasks.len())
            .field(
                "queued_rows",
                &(self.shared.import_queue.len()
                    + self.shared.hint_queue.len()
                    + self.shared.regular_queue.len()
                    + self.shared.error_queue.len()),
            )
            .field("fatal", &self.fatal)
            .finish()
    }
}

impl Request {
    /// Starts a session that will encode `root` as row zero.
    pub fn new(root: Value, options: EncodeOptions) -> Self {
        let EncodeOptions {
            manifest,
            on_error,
            on_postpone,
            identifier_prefix: _,
            debug,
            temporary_references,
            taint,
            signal,
        } = options;
        let mut shared = RequestShared {
            manifest,
            on_error,
            on_postpone,
            debug,
            temporary_references,
            taint,
            signal,
            text_outline: true,
            next_id: 0,
            written: HashMap::new(),
            repeats: HashSet::new(),
            written_symbols: HashMap::new(),
            written_refs: HashMap::new(),
            model_root: None,
            import_queue: VecDeque::new(),
            hint_queue: VecDeque::new(),
            regular_queue: VecDeque::new(),
            error_queue: VecDeque::new(),
            tasks: HashMap::new(),
            mailbox: Mailbox::new(),
        };
        let root_id = shared.alloc_id();
        shared.spawn_model_task(root_id, DeferredValue::fulfilled(root));
        Self {
            shared,
            status: RequestStatus::Active,
            fatal: None,
        }
    }

    /// Runs every task whose source has settled, then flushes finished
    /// rows into `sink`.
    pub fn poll(&mut self, sink: &mut dyn RowSink) -> Result<Progress> {
        let mut consumer = SinkConsumer::new(sink);
        self.drive(&mut consumer)
    }

    /// Cancels the session. Every task still waiting resolves to the
    /// given reason on the receiving side; rows already queued still
    /// flush on the next poll.
    pub fn abort(&mut self, reason: ErrorValue) {
        if self.status != RequestStatus::Active {
            return;
        }
        self.status = RequestStatus::Aborted;
        if self.shared.tasks.is_empty() {
            return;
        }
        let (row_tag, text) = if reason.is_postpone() {
            (tag::POSTPONE, self.shared.postpone_row_json(&reason))
        } else {
            (tag::ERROR, self.shared.error_row_json(&reason))
        };
        // One shared failure row; pending model rows reference it, while
        // streams fail at their own id.
        let shared_id = self.shared.alloc_id();
        self.shared.error_queue.push_back(WireRow {
            id: shared_id,
            body: RowBody::Tagged {
                tag: row_tag,
                text: text.clone(),
            },
        });
        let reference = serde_json::Value::String(serializer::ref_token(shared_id)).to_string();
        let tasks = std::mem::take(&mut self.shared.tasks);
        let mut ids: Vec<_> = tasks.into_iter().collect();
        ids.sort_by_key(|(id, _)| id.0);
        for (id, task) in ids {
            match task {
                Task::Model(_) => self.shared.error_queue.push_back(WireRow {
                    id,
                    body: RowBody::Model(reference.clone()),
                }),
                Task::Stream(_) => self.shared.error_queue.push_back(WireRow {
                    id,
                    body: RowBody::Tagged {
                        tag: row_tag,
                        text: text.clone(),
                    },
                }),
            }
        }
    }

    /// Queues a hint row. The payload must be plain JSON data.
    pub fn hint(&mut self, code: u8, model: &Value) -> Result<()> {
        if self.status != RequestStatus::Active {
            return Err(RowcodeError::Closed(
                "cannot hint on a finished session".into(),
            ));
        }
        let json = serializer::plain_to_json(model)?;
        self.shared.hint_queue.push_back(WireRow {
            id: RowId::ROOT,
            body: RowBody::Hint {
                code,
                json: json.to_string(),
            },
        });
        Ok(())
    }

    /// Where the session is in its lifecycle.
    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// True when a settled source is waiting to be picked up by the next
    /// poll. Sync drivers use this to tell patience from deadlock.
    pub(crate) fn has_pending_wakeups(&self) -> bool {
        !self.shared.mailbox.is_empty()
    }

    fn run_ready(&mut self) -> Result<()> {
        loop {
            let woken = self.shared.mailbox.drain();
            if woken.is_empty() {
                return Ok(());
            }
            for token in woken {
                self.run_task(RowId(token))?;
            }
        }
    }

    fn run_task(&mut self, id: RowId) -> Result<()> {
        let task = match self.shared.tasks.get(&id) {
            Some(task) => task.clone(),
            // Stale wakeup for a task that already finished or aborted.
            None => return Ok(()),
        };
        match task {
            Task::Model(source) => self.run_model_task(id, &source),
            Task::Stream(source) => self.run_stream_task(id, &source),
        }
    }

    fn run_model_task(&mut self, id: RowId, source: &DeferredValue) -> Result<()> {
        match source.state() {
            DeferredState::Pending => {
                source.subscribe(Waker::new(&self.shared.mailbox, id.0));
                Ok(())
            }
            DeferredState::Fulfilled(value) => {
                self.shared.tasks.remove(&id);
                self.emit_model_row(id, &value, true)?;
                Ok(())
            }
            DeferredState::Rejected(error) => {
                self.shared.tasks.remove(&id);
                self.shared.emit_failure_row(id, &error);
                Ok(())
            }
        }
    }

    fn run_stream_task(&mut self, id: RowId, source: &StreamValue) -> Result<()> {
        loop {
            match source.poll_next() {
                StreamPoll::Item(item) => {
                    self.emit_model_row(id, &item, false)?;
                }
                StreamPoll::Pending => {
                    source.subscribe(Waker::new(&self.shared.mailbox, id.0));
                    return Ok(());
                }
                StreamPoll::Done(final_value) => {
                    self.shared.tasks.remove(&id);
                    let text = match final_value {
                        Some(value) if source.kind().is_iterable() => {
                            self.render_row_json(id, &value, false)?.to_string()
                        }
                        _ => String::new(),
                    };
                    self.shared.regular_queue.push_back(WireRow {
                        id,
                        body: RowBody::Tagged {
                            tag: tag::STREAM_CLOSE,
                            text,
                        },
                    });
                    return Ok(());
                }
                StreamPoll::Failed(error) => {
                    self.shared.tasks.remove(&id);
                    self.shared.emit_failure_row(id, &error);
                    return Ok(());
                }
            }
        }
    }

    /// Renders `value` as the payload of row `id` and queues it.
    ///
    /// `register` records the value's identity as an alias for this row.
    /// True for rows that hold exactly one value; false for stream rows,
    /// where the id names the stream rather than any one item.
    fn emit_model_row(&mut self, id: RowId, value: &Value, register: bool) -> Result<()> {
        let json = self.render_row_json(id, value, register)?;
        self.shared.regular_queue.push_back(WireRow {
            id,
            body: RowBody::Model(json.to_string()),
        });
        Ok(())
    }

    fn render_row_json(
        &mut self,
        id: RowId,
        value: &Value,
        register: bool,
    ) -> Result<serde_json::Value> {
        serializer::note_repeats(&mut self.shared, value);
        if let Some(vid) = value.identity() {
            if register {
                self.shared
                    .written
                    .entry(vid)
                    .or_insert_with(|| ObjectRef::Written(serializer::ref_token(id)));
            }
            self.shared.model_root = Some(vid);
        } else {
            self.shared.model_root = None;
        }
        let rendered = render_model(&mut self.shared, value);
        self.shared.model_root = None;
        rendered
    }

    fn flush(&mut self, consumer: &mut dyn RowConsumer) -> Result<bool> {
        loop {
            let row = match self.next_row() {
                Some(row) => row,
                None => return Ok(true),
            };
            match consumer.consume(&row)? {
                WriteFlow::Ready => {}
                WriteFlow::Full => return Ok(false),
            }
        }
    }

    fn next_row(&mut self) -> Option<WireRow> {
        self.shared
            .import_queue
            .pop_front()
            .or_else(|| self.shared.hint_queue.pop_front())
            .or_else(|| self.shared.regular_queue.pop_front())
            .or_else(|| self.shared.error_queue.pop_front())
    }

    fn drive(&mut self, consumer: &mut dyn RowConsumer) -> Result<Progress> {
        if self.status == RequestStatus::Closed {
            return Ok(Progress::Complete);
        }
        if let Some(error) = &self.fatal {
            return Err(error.clone());
        }
        if self.status == RequestStatus::Active {
            if let Some(reason) = self.shared.signal.as_ref().and_then(|s| s.reason()) {
                self.abort(reason);
            }
        }
        if let Err(error) = self.run_ready() {
            self.fatal = Some(error.clone());
            return Err(error);
        }
        let flushed = match self.flush(consumer) {
            Ok(flushed) => flushed,
            Err(error) => {
                self.fatal = Some(error.clone());
                return Err(error);
            }
        };
        if !flushed {
            return Ok(Progress::SinkFull);
        }
        if self.shared.tasks.is_empty() && self.shared.queues_empty() {
            consumer.finish()?;
            self.status = RequestStatus::Closed;
            return Ok(Progress::Complete);
        }
        Ok(Progress::AwaitingValues)
    }
}

// --- FORM TRANSPORT ---

/// Encodes a whole graph into named form fields.
///
/// Every source must settle without outside help, so a stalled session is
/// a deadlock rather than something to wait out.
pub(crate) fn encode_form_fields(root: Value, options: EncodeOptions) -> Result<FormPayload> {
    let prefix = options.identifier_prefix.clone().unwrap_or_default();
    let mut request = Request::new(root, options);
    request.shared.text_outline = false;
    let mut consumer = FormConsumer::new(prefix);
    loop {
        match request.drive(&mut consumer)? {
            Progress::Complete => break,
            Progress::SinkFull => {}
            Progress::AwaitingValues => {
                if !request.has_pending_wakeups() {
                    return Err(RowcodeError::Deadlock(
                        "the value graph waits on sources that nothing can settle".into(),
                    ));
                }
            }
        }
    }
    Ok(consumer.into_fields())
}
