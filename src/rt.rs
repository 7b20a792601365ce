//! Runtime cells backing the asynchronous leaves of a value graph.
//!
//! The codec itself is single-threaded and host-pumped; these cells are the
//! crossing points where a host (possibly on another thread) hands late
//! values in. Settling a cell never touches scheduler state directly: it
//! flips the cell's own state and drops a wake token into the owning
//! session's [`Mailbox`], which the session drains on its next pump.
//!
//! [`DeferredValue`] is a settle-once slot. [`StreamValue`] is a queue that
//! ends with either a close (optionally carrying a final value) or a
//! failure. [`AbortSignal`] is a cooperative cancellation flag checked at
//! pump boundaries.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::value::{ErrorValue, Value, ValueId};

fn lock_cell<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Cell writes are single assignments; rewinding a poisoned lock is safe.
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

// --- WAKE PLUMBING ---

/// Queue of wake tokens delivered by settling cells, drained by the pump.
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    woken: Mutex<Vec<u32>>,
}

impl Mailbox {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push(&self, token: u32) {
        lock_cell(&self.woken).push(token);
    }

    /// Takes every queued token, preserving arrival order.
    pub(crate) fn drain(&self) -> Vec<u32> {
        std::mem::take(&mut *lock_cell(&self.woken))
    }

    pub(crate) fn is_empty(&self) -> bool {
        lock_cell(&self.woken).is_empty()
    }
}

/// One-shot wake registration: pings a mailbox with a fixed token.
///
/// Holds the mailbox weakly so abandoned sessions do not keep cells from
/// dropping their registrations.
#[derive(Debug, Clone)]
pub(crate) struct Waker {
    mailbox: Weak<Mailbox>,
    token: u32,
}

impl Waker {
    pub(crate) fn new(mailbox: &Arc<Mailbox>, token: u32) -> Self {
        Self {
            mailbox: Arc::downgrade(mailbox),
            token,
        }
    }

    pub(crate) fn ping(&self) {
        if let Some(mailbox) = self.mailbox.upgrade() {
            mailbox.push(self.token);
        }
    }
}

// --- DEFERRED VALUES ---

/// Observable state of a [`DeferredValue`].
#[derive(Debug, Clone)]
pub enum DeferredState {
    /// Not settled yet.
    Pending,
    /// Settled with a value.
    Fulfilled(Value),
    /// Settled with a failure.
    Rejected(Arc<ErrorValue>),
}

#[derive(Debug)]
struct DeferredInner {
    state: DeferredState,
    hanging: bool,
    subs: Vec<Waker>,
}

/// A value that settles later. Clones alias the same slot.
///
/// The first `fulfill`/`reject` wins; later settles are ignored and report
/// `false`. A *hanging* deferred is one that can never settle, used for
/// values deliberately left open on the wire (`$@` with no row).
#[derive(Debug, Clone)]
pub struct DeferredValue {
    cell: Arc<Mutex<DeferredInner>>,
}

impl DeferredValue {
    /// A pending deferred, to be settled by the host.
    pub fn new() -> Self {
        Self::with_state(DeferredState::Pending, false)
    }

    /// An already-fulfilled deferred.
    pub fn fulfilled(value: Value) -> Self {
        Self::with_state(DeferredState::Fulfilled(value), false)
    }

    /// An already-rejected deferred.
    pub fn rejected(reason: ErrorValue) -> Self {
        Self::with_state(DeferredState::Rejected(Arc::new(reason)), false)
    }

    /// A deferred that never settles.
    pub fn hanging() -> Self {
        Self::with_state(DeferredState::Pending, true)
    }

    fn with_state(state: DeferredState, hanging: bool) -> Self {
        Self {
            cell: Arc::new(Mutex::new(DeferredInner {
                state,
                hanging,
                subs: Vec::new(),
            })),
        }
    }

    /// Settles with a value. Returns whether this call did the settling.
    pub fn fulfill(&self, value: Value) -> bool {
        self.settle(DeferredState::Fulfilled(value))
    }

    /// Settles with a failure. Returns whether this call did the settling.
    pub fn reject(&self, reason: ErrorValue) -> bool {
        self.settle(DeferredState::Rejected(Arc::new(reason)))
    }

    fn settle(&self, next: DeferredState) -> bool {
        let wakers = {
            let mut inner = lock_cell(&self.cell);
            if inner.hanging || !matches!(inner.state, DeferredState::Pending) {
                return false;
            }
            inner.state = next;
            std::mem::take(&mut inner.subs)
        };
        for waker in wakers {
            waker.ping();
        }
        true
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> DeferredState {
        lock_cell(&self.cell).state.clone()
    }

    /// True while unsettled.
    pub fn is_pending(&self) -> bool {
        matches!(lock_cell(&self.cell).state, DeferredState::Pending)
    }

    /// True for a deferred that can never settle.
    pub fn is_hanging(&self) -> bool {
        lock_cell(&self.cell).hanging
    }

    /// Identity of the slot, shared by all clones.
    pub fn identity(&self) -> ValueId {
        ValueId::from_addr(Arc::as_ptr(&self.cell) as usize)
    }

    /// Registers a wake-on-settle; pings immediately if already settled.
    pub(crate) fn subscribe(&self, waker: Waker) {
        let settled = {
            let mut inner = lock_cell(&self.cell);
            if matches!(inner.state, DeferredState::Pending) && !inner.hanging {
                inner.subs.push(waker.clone());
                false
            } else {
                true
            }
        };
        if settled {
            waker.ping();
        }
    }
}

impl Default for DeferredValue {
    fn default() -> Self {
        Self::new()
    }
}

// --- STREAMS ---

/// Which wire flavor a stream encodes as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// A readable stream of values (`R` rows).
    Readable,
    /// A readable stream of binary chunks (`r` rows).
    ReadableBytes,
    /// An async iterable (`X` rows); may close with a final value.
    AsyncIterable,
    /// A single-consumer async iterator (`x` rows); may close with a final value.
    AsyncIterator,
}

impl StreamKind {
    /// True for the iterable flavors, which may carry a close value.
    pub fn is_iterable(self) -> bool {
        matches!(self, Self::AsyncIterable | Self::AsyncIterator)
    }
}

/// How a stream ended.
#[derive(Debug, Clone)]
enum StreamEnd {
    Done(Option<Value>),
    Failed(Arc<ErrorValue>),
}

#[derive(Debug)]
struct StreamInner {
    queue: VecDeque<Value>,
    end: Option<StreamEnd>,
    subs: Vec<Waker>,
}

/// Result of polling a stream for its next item.
#[derive(Debug, Clone)]
pub enum StreamPoll {
    /// The next queued item.
    Item(Value),
    /// The stream closed; iterable flavors may carry a final value.
    Done(Option<Value>),
    /// Nothing queued yet; the producer may still push.
    Pending,
    /// The stream failed.
    Failed(Arc<ErrorValue>),
}

/// An incrementally-produced sequence of values. Clones alias the queue.
///
/// The producer side pushes items and eventually closes or fails the
/// stream; the consumer side polls items out in order. On the wire each
/// item becomes a row sharing the stream's id, terminated by a close row.
#[derive(Debug, Clone)]
pub struct StreamValue {
    kind: StreamKind,
    cell: Arc<Mutex<StreamInner>>,
}

impl StreamValue {
    /// A readable stream of values.
    pub fn readable() -> Self {
        Self::with_kind(StreamKind::Readable)
    }

    /// A readable stream of binary chunks.
    pub fn readable_bytes() -> Self {
        Self::with_kind(StreamKind::ReadableBytes)
    }

    /// An async iterable.
    pub fn async_iterable() -> Self {
        Self::with_kind(StreamKind::AsyncIterable)
    }

    /// A single-consumer async iterator.
    pub fn async_iterator() -> Self {
        Self::with_kind(StreamKind::AsyncIterator)
    }

    fn with_kind(kind: StreamKind) -> Self {
        Self {
            kind,
            cell: Arc::new(Mutex::new(StreamInner {
                queue: VecDeque::new(),
                end: None,
                subs: Vec::new(),
            })),
        }
    }

    /// The wire flavor.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Queues an item. Returns `false` once the stream has ended.
    pub fn push(&self, value: Value) -> bool {
        self.signal(|inner| inner.queue.push_back(value))
    }

    /// Closes the stream. Returns `false` if it already ended.
    pub fn close(&self) -> bool {
        self.signal(|inner| inner.end = Some(StreamEnd::Done(None)))
    }

    /// Closes the stream with a final value.
    ///
    /// The final value reaches the other side for the iterable flavors
    /// only; readable streams close bare.
    pub fn close_with(&self, value: Value) -> bool {
        self.signal(|inner| inner.end = Some(StreamEnd::Done(Some(value))))
    }

    /// Fails the stream. Returns `false` if it already ended.
    pub fn fail(&self, reason: ErrorValue) -> bool {
        self.signal(|inner| inner.end = Some(StreamEnd::Failed(Arc::new(reason))))
    }

    fn signal(&self, apply: impl FnOnce(&mut StreamInner)) -> bool {
        let wakers = {
            let mut inner = lock_cell(&self.cell);
            if inner.end.is_some() {
                return false;
            }
            apply(&mut inner);
            std::mem::take(&mut inner.subs)
        };
        for waker in wakers {
            waker.ping();
        }
        true
    }

    /// Pops the next item, or reports the stream's final state.
    pub fn poll_next(&self) -> StreamPoll {
        let mut inner = lock_cell(&self.cell);
        if let Some(value) = inner.queue.pop_front() {
            return StreamPoll::Item(value);
        }
        match &inner.end {
            Some(StreamEnd::Done(value)) => StreamPoll::Done(value.clone()),
            Some(StreamEnd::Failed(reason)) => StreamPoll::Failed(Arc::clone(reason)),
            None => StreamPoll::Pending,
        }
    }

    /// Identity of the queue, shared by all clones.
    pub fn identity(&self) -> ValueId {
        ValueId::from_addr(Arc::as_ptr(&self.cell) as usize)
    }

    /// Registers a wake for the next push/close/fail; pings immediately if
    /// items are already queued or the stream already ended.
    pub(crate) fn subscribe(&self, waker: Waker) {
        let ready = {
            let mut inner = lock_cell(&self.cell);
            if inner.queue.is_empty() && inner.end.is_none() {
                inner.subs.push(waker.clone());
                false
            } else {
                true
            }
        };
        if ready {
            waker.ping();
        }
    }
}

// --- ABORT SIGNAL ---

#[derive(Debug, Default)]
struct SignalInner {
    tripped: AtomicBool,
    reason: Mutex<Option<ErrorValue>>,
}

/// Cooperative cancellation flag, checked by the encode pump.
///
/// Clones alias the same flag; the first `abort` wins.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

impl AbortSignal {
    /// A fresh, untripped signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips the signal. Later calls keep the first reason.
    pub fn abort(&self, reason: ErrorValue) {
        let mut slot = lock_cell(&self.inner.reason);
        if slot.is_none() {
            *slot = Some(reason);
            self.inner.tripped.store(true, Ordering::Release);
        }
    }

    /// True once tripped.
    pub fn is_aborted(&self) -> bool {
        self.inner.tripped.load(Ordering::Acquire)
    }

    /// The first abort reason, once tripped.
    pub fn reason(&self) -> Option<ErrorValue> {
        lock_cell(&self.inner.reason).clone()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::panic)]

    use super::*;

    #[test]
    fn deferred_settles_once_and_pings() {
        let mailbox = Mailbox::new();
        let cell = DeferredValue::new();
        cell.subscribe(Waker::new(&mailbox, 7));
        assert!(mailbox.is_empty());

        assert!(cell.fulfill(Value::from(1)));
        assert!(!cell.fulfill(Value::from(2)), "second settle is ignored");
        assert!(!cell.reject(ErrorValue::new("late")));
        assert_eq!(mailbox.drain(), [7]);

        match cell.state() {
            DeferredState::Fulfilled(v) => assert_eq!(v, Value::from(1)),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn subscribing_to_settled_deferred_pings_immediately() {
        let mailbox = Mailbox::new();
        let cell = DeferredValue::fulfilled(Value::Null);
        cell.subscribe(Waker::new(&mailbox, 3));
        assert_eq!(mailbox.drain(), [3]);
    }

    #[test]
    fn hanging_deferred_never_settles() {
        let cell = DeferredValue::hanging();
        assert!(!cell.fulfill(Value::Null));
        assert!(cell.is_pending());
        assert!(cell.is_hanging());
    }

    #[test]
    fn stream_delivers_in_order_then_done() {
        let stream = StreamValue::readable();
        assert!(stream.push(Value::from(1)));
        assert!(stream.push(Value::from(2)));
        assert!(stream.close());
        assert!(!stream.push(Value::from(3)), "push after close is refused");

        assert!(matches!(stream.poll_next(), StreamPoll::Item(v) if v == Value::from(1)));
        assert!(matches!(stream.poll_next(), StreamPoll::Item(v) if v == Value::from(2)));
        assert!(matches!(stream.poll_next(), StreamPoll::Done(None)));
        assert!(matches!(stream.poll_next(), StreamPoll::Done(None)));
    }

    #[test]
    fn abort_signal_keeps_first_reason() {
        let signal = AbortSignal::new();
        assert!(!signal.is_aborted());
        signal.abort(ErrorValue::new("timeout"));
        signal.abort(ErrorValue::new("second"));
        assert!(signal.is_aborted());
        assert_eq!(signal.reason().unwrap().message, "timeout");
    }
}
