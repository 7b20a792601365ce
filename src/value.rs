//! The dynamic value model carried by the codec.
//!
//! [`Value`] is a JS-flavored dynamic tree: JSON scalars plus the extended
//! vocabulary the wire protocol knows how to tag (undefined, NaN, negative
//! zero, big integers, dates, symbols, binary buffers, maps, sets, blobs,
//! form payloads, errors, module references) and the asynchronous leaves
//! (deferred values and streams).
//!
//! ## Sharing and identity
//!
//! Containers are `Arc`-backed: cloning a [`Value`] is cheap and clones
//! alias the same underlying storage. Pointer identity is observable
//! through [`Value::identity`] and [`Value::ptr_eq`], which is how decoded
//! graphs expose "these two places are the same object".
//!
//! A [`SharedCell`] is the *explicit* identity claim: the encoder gives a
//! cell its own row the first time it is seen, so every occurrence decodes
//! to one aliased value. Plain containers are inlined at first use and only
//! get a row of their own when they turn out to be referenced again. Cells
//! are also the way to close a cycle by hand:
//!
//! ```rust
//! use rowcode::{SharedCell, Value};
//!
//! let cell = SharedCell::empty();
//! let obj = Value::object([("self", Value::from(cell.clone()))]);
//! cell.set(obj.clone());
//! // obj.self now aliases obj through the cell
//! ```
//!
//! Interior mutability exists so cycles can be built (and patched on
//! decode); mutating a value while an encode pass is reading it is outside
//! the contract.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Result, RowcodeError};
use crate::format::BinaryKind;
use crate::modules::{ClientReference, ServerReference};
use crate::rt::{DeferredValue, StreamValue};

// --- SHARED CONTAINERS ---

/// Opaque identity of one shared allocation, usable as a map key.
///
/// Two values have the same `ValueId` iff they alias the same storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(usize);

impl ValueId {
    pub(crate) fn from_addr(addr: usize) -> Self {
        Self(addr)
    }
}

/// Backing cell shared by all container types.
struct Cell<T>(Arc<Mutex<T>>);

impl<T> Cell<T> {
    fn new(inner: T) -> Self {
        Self(Arc::new(Mutex::new(inner)))
    }

    /// Poisoning cannot leave value storage in a broken state (every write
    /// is a single slot assignment), so a poisoned lock is recovered.
    fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn identity(&self) -> ValueId {
        ValueId(Arc::as_ptr(&self.0) as usize)
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: fmt::Debug> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // try_lock so printing a cyclic graph terminates instead of
        // deadlocking on a lock already held further up the stack.
        match self.0.try_lock() {
            Ok(guard) => guard.fmt(f),
            Err(_) => write!(f, "<in use>"),
        }
    }
}

/// Shared, ordered list storage backing arrays and sets.
#[derive(Clone, Debug)]
pub struct SharedList(Cell<Vec<Value>>);

impl SharedList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self(Cell::new(Vec::new()))
    }

    /// Wraps existing items.
    pub fn from_vec(items: Vec<Value>) -> Self {
        Self(Cell::new(items))
    }

    /// Appends an item.
    pub fn push(&self, value: Value) {
        self.0.lock().push(value);
    }

    /// Clones out the item at `index`.
    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.lock().get(index).cloned()
    }

    /// Overwrites the item at `index`; used when a forward reference or
    /// cycle is patched in after the fact.
    pub fn set(&self, index: usize, value: Value) -> Result<()> {
        let mut items = self.0.lock();
        match items.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RowcodeError::Internal(format!(
                "list patch index {index} out of bounds ({} items)",
                items.len()
            ))),
        }
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// True when the list holds no items.
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Clones the current items out as a plain vector.
    pub fn snapshot(&self) -> Vec<Value> {
        self.0.lock().clone()
    }

    /// Identity of the backing storage.
    pub fn identity(&self) -> ValueId {
        self.0.identity()
    }

    /// True when both handles alias the same storage.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

impl Default for SharedList {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<Value> for SharedList {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

/// Shared, insertion-ordered string-keyed record backing objects.
#[derive(Clone, Debug)]
pub struct SharedRecord(Cell<Vec<(Arc<str>, Value)>>);

impl SharedRecord {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self(Cell::new(Vec::new()))
    }

    /// Wraps existing entries, keeping their order.
    pub fn from_entries(entries: Vec<(Arc<str>, Value)>) -> Self {
        Self(Cell::new(entries))
    }

    /// Clones out the value under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.0
            .lock()
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v.clone())
    }

    /// Inserts or replaces `key`, keeping the original position on replace.
    pub fn insert(&self, key: impl Into<Arc<str>>, value: Value) {
        let key = key.into();
        let mut entries = self.0.lock();
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => entries.push((key, value)),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// True when the record holds no entries.
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Clones the entries out in order.
    pub fn snapshot(&self) -> Vec<(Arc<str>, Value)> {
        self.0.lock().clone()
    }

    /// Identity of the backing storage.
    pub fn identity(&self) -> ValueId {
        self.0.identity()
    }

    /// True when both handles alias the same storage.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

impl Default for SharedRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared, ordered key/value entry list backing maps.
///
/// Entries keep arrival order; keys may be any value and are matched
/// structurally on lookup.
#[derive(Clone, Debug)]
pub struct SharedEntries(Cell<Vec<(Value, Value)>>);

impl SharedEntries {
    /// Creates an empty entry list.
    pub fn new() -> Self {
        Self(Cell::new(Vec::new()))
    }

    /// Wraps existing entries, keeping their order.
    pub fn from_entries(entries: Vec<(Value, Value)>) -> Self {
        Self(Cell::new(entries))
    }

    /// Appends an entry.
    pub fn push(&self, key: Value, value: Value) {
        self.0.lock().push((key, value));
    }

    /// Clones out the first value whose key structurally equals `key`.
    pub fn get(&self, key: &Value) -> Option<Value> {
        self.0
            .lock()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// True when the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Clones the entries out in order.
    pub fn snapshot(&self) -> Vec<(Value, Value)> {
        self.0.lock().clone()
    }

    /// Identity of the backing storage.
    pub fn identity(&self) -> ValueId {
        self.0.identity()
    }

    /// True when both handles alias the same storage.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

impl Default for SharedEntries {
    fn default() -> Self {
        Self::new()
    }
}

/// A single shared slot: the explicit identity/cycle anchor.
///
/// Encoding a cell assigns it a row on first sighting, so all occurrences
/// decode to one aliased value. See the module docs for the cycle idiom.
#[derive(Clone, Debug)]
pub struct SharedCell(Cell<Value>);

impl SharedCell {
    /// Creates a cell around `value`.
    pub fn new(value: Value) -> Self {
        Self(Cell::new(value))
    }

    /// Creates a cell holding `Null`, to be filled via [`SharedCell::set`].
    pub fn empty() -> Self {
        Self::new(Value::Null)
    }

    /// Clones the current content out.
    pub fn get(&self) -> Value {
        self.0.lock().clone()
    }

    /// Replaces the content.
    pub fn set(&self, value: Value) {
        *self.0.lock() = value;
    }

    /// Identity of the cell itself (not of its content).
    pub fn identity(&self) -> ValueId {
        self.0.identity()
    }

    /// True when both handles alias the same cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

// --- LEAF PAYLOADS ---

/// Raw binary payload with a declared element kind.
#[derive(Clone, Debug)]
pub struct Binary {
    kind: BinaryKind,
    data: Arc<[u8]>,
}

impl Binary {
    /// Creates a binary value, validating that the byte length is a whole
    /// number of elements for `kind`.
    pub fn new(kind: BinaryKind, data: Vec<u8>) -> Result<Self> {
        let width = kind.element_width();
        if data.len() % width != 0 {
            return Err(RowcodeError::Format(format!(
                "binary payload of {} bytes is not a multiple of the {width}-byte element width",
                data.len()
            )));
        }
        Ok(Self {
            kind,
            data: data.into(),
        })
    }

    /// Creates an untyped byte buffer.
    pub fn buffer(data: Vec<u8>) -> Self {
        Self {
            kind: BinaryKind::Buffer,
            data: data.into(),
        }
    }

    pub(crate) fn from_shared(kind: BinaryKind, data: Arc<[u8]>) -> Self {
        Self { kind, data }
    }

    /// The declared element kind.
    pub fn kind(&self) -> BinaryKind {
        self.kind
    }

    /// The raw little-endian element bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of elements.
    pub fn element_count(&self) -> usize {
        self.data.len() / self.kind.element_width()
    }

    pub(crate) fn data_shared(&self) -> Arc<[u8]> {
        Arc::clone(&self.data)
    }

    pub(crate) fn data_identity(&self) -> ValueId {
        ValueId(Arc::as_ptr(&self.data) as *const u8 as usize)
    }
}

impl PartialEq for Binary {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.data == other.data
    }
}

/// A typed byte payload with a media type, transported via an outlined row.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobValue {
    /// Media type, e.g. `"text/plain"`.
    pub mime: String,
    /// The payload bytes.
    pub data: Vec<u8>,
}

/// One entry of a form payload.
#[derive(Debug, Clone, PartialEq)]
pub enum FormEntry {
    /// A text field.
    Text(String),
    /// A binary field, with optional metadata: the media type for
    /// blob-backed entries, or the row tag on the form transport.
    Bytes(Vec<u8>, Option<String>),
}

/// An ordered multimap of named form entries.
///
/// Doubles as the wire shape of `$K` values and as the input of the
/// form-field decode path, where keys follow the `<prefix><id>` convention.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormPayload {
    entries: Vec<(String, FormEntry)>,
}

impl FormPayload {
    /// Creates an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry; duplicate names are allowed and kept in order.
    pub fn append(&mut self, name: impl Into<String>, entry: FormEntry) {
        self.entries.push((name.into(), entry));
    }

    /// First entry under `name`, if any.
    pub fn get(&self, name: &str) -> Option<&FormEntry> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| e)
    }

    /// All entries in order.
    pub fn entries(&self) -> &[(String, FormEntry)] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Which failure family an [`ErrorValue`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A real failure.
    Error,
    /// An intentional bail-out: reported like an error, semantically not one.
    Postpone,
}

/// A failure travelling as data: chunk rejection reasons, `$Z` values, and
/// abort reasons all carry this shape.
///
/// In production encodes only `digest` crosses the wire; `message` and
/// `stack` are development-mode payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    /// Human-readable description.
    pub message: String,
    /// Optional captured backtrace text.
    pub stack: Option<String>,
    /// Opaque identifier assigned by the error hook, safe for production.
    pub digest: Option<String>,
    /// Failure family.
    pub kind: ErrorKind,
}

impl ErrorValue {
    /// A plain error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            digest: None,
            kind: ErrorKind::Error,
        }
    }

    /// An intentional bail-out.
    pub fn postpone(reason: impl Into<String>) -> Self {
        Self {
            message: reason.into(),
            stack: None,
            digest: None,
            kind: ErrorKind::Postpone,
        }
    }

    /// Attaches a backtrace text.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Attaches a digest.
    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// True for the postpone family.
    pub fn is_postpone(&self) -> bool {
        self.kind == ErrorKind::Postpone
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::Error => write!(f, "{}", self.message),
            ErrorKind::Postpone => write!(f, "postponed: {}", self.message),
        }
    }
}

impl std::error::Error for ErrorValue {}

impl From<RowcodeError> for ErrorValue {
    fn from(err: RowcodeError) -> Self {
        Self::new(err.to_string())
    }
}

// --- VALUE ---

/// One node of the dynamic value graph.
///
/// Cloning is cheap; containers alias their storage (see module docs).
#[derive(Clone, Debug)]
pub enum Value {
    /// JSON `null`.
    Null,
    /// The `undefined` scalar, distinct from `Null`.
    Undefined,
    /// A boolean.
    Bool(bool),
    /// An IEEE double; NaN, infinities and negative zero round-trip.
    Number(f64),
    /// An arbitrary-precision-ish integer (decimal wire form).
    BigInt(i128),
    /// UTF-8 text.
    String(Arc<str>),
    /// A calendar instant, carried as its ISO-8601 wire text verbatim.
    Date(Arc<str>),
    /// A globally-registered symbol, identified by name.
    Symbol(Arc<str>),
    /// Raw typed binary data.
    Binary(Binary),
    /// An ordered list.
    Array(SharedList),
    /// An insertion-ordered string-keyed record.
    Object(SharedRecord),
    /// An ordered key/value map; keys may be any value.
    Map(SharedEntries),
    /// An ordered set.
    Set(SharedList),
    /// A mime-typed byte payload.
    Blob(Arc<BlobValue>),
    /// A form payload (ordered named entries).
    Form(Arc<FormPayload>),
    /// A failure as data.
    Error(Arc<ErrorValue>),
    /// An explicit identity/cycle anchor.
    Shared(SharedCell),
    /// A value that settles later.
    Deferred(DeferredValue),
    /// An incrementally-produced sequence of values.
    Stream(StreamValue),
    /// A reference to consumer-side code, resolved through the manifest.
    ClientRef(Arc<ClientReference>),
    /// A reference to a producer-side function, callable from the consumer.
    ServerRef(Arc<ServerReference>),
    /// A placeholder for a value that never crosses the wire, resolved
    /// against a temporary-reference set on the other side.
    TempRef(Arc<str>),
}

impl Value {
    /// Builds an array from items.
    pub fn array(items: impl IntoIterator<Item = Value>) -> Value {
        Value::Array(items.into_iter().collect())
    }

    /// Builds an object from `(key, value)` pairs, keeping their order.
    pub fn object<K: Into<Arc<str>>>(entries: impl IntoIterator<Item = (K, Value)>) -> Value {
        Value::Object(SharedRecord::from_entries(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    /// Builds a map from `(key, value)` pairs, keeping their order.
    pub fn map(entries: impl IntoIterator<Item = (Value, Value)>) -> Value {
        Value::Map(SharedEntries::from_entries(entries.into_iter().collect()))
    }

    /// Builds a set from items, keeping their order.
    pub fn set(items: impl IntoIterator<Item = Value>) -> Value {
        Value::Set(items.into_iter().collect())
    }

    /// True for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for `Undefined`.
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// True for a NaN number.
    pub fn is_nan(&self) -> bool {
        matches!(self, Value::Number(n) if n.is_nan())
    }

    /// True for IEEE negative zero.
    pub fn is_negative_zero(&self) -> bool {
        matches!(self, Value::Number(n) if *n == 0.0 && n.is_sign_negative())
    }

    /// The boolean, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The number, if this is one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The big integer, if this is one.
    pub fn as_bigint(&self) -> Option<i128> {
        match self {
            Value::BigInt(n) => Some(*n),
            _ => None,
        }
    }

    /// The text, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The list handle, if this is an array.
    pub fn as_array(&self) -> Option<&SharedList> {
        match self {
            Value::Array(list) => Some(list),
            _ => None,
        }
    }

    /// The record handle, if this is an object.
    pub fn as_object(&self) -> Option<&SharedRecord> {
        match self {
            Value::Object(record) => Some(record),
            _ => None,
        }
    }

    /// The entry handle, if this is a map.
    pub fn as_map(&self) -> Option<&SharedEntries> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// The deferred handle, if this is one.
    pub fn as_deferred(&self) -> Option<&DeferredValue> {
        match self {
            Value::Deferred(cell) => Some(cell),
            _ => None,
        }
    }

    /// The stream handle, if this is one.
    pub fn as_stream(&self) -> Option<&StreamValue> {
        match self {
            Value::Stream(cell) => Some(cell),
            _ => None,
        }
    }

    /// Object field access; sees through `Shared` cells.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Value::Object(record) => record.get(key),
            Value::Shared(cell) => cell.get().get(key),
            _ => None,
        }
    }

    /// Array index access; sees through `Shared` cells.
    pub fn index(&self, index: usize) -> Option<Value> {
        match self {
            Value::Array(list) => list.get(index),
            Value::Shared(cell) => cell.get().index(index),
            _ => None,
        }
    }

    /// Identity of the backing allocation, for values that have one.
    ///
    /// Scalars have no identity. For a `Shared` cell this is the cell's own
    /// identity, not its content's.
    pub fn identity(&self) -> Option<ValueId> {
        match self {
            Value::Array(v) | Value::Set(v) => Some(v.identity()),
            Value::Object(v) => Some(v.identity()),
            Value::Map(v) => Some(v.identity()),
            Value::Shared(v) => Some(v.identity()),
            Value::Binary(v) => Some(v.data_identity()),
            Value::Blob(v) => Some(ValueId(Arc::as_ptr(v) as usize)),
            Value::Form(v) => Some(ValueId(Arc::as_ptr(v) as usize)),
            Value::Error(v) => Some(ValueId(Arc::as_ptr(v) as usize)),
            Value::Deferred(v) => Some(v.identity()),
            Value::Stream(v) => Some(v.identity()),
            Value::ClientRef(v) => Some(ValueId(Arc::as_ptr(v) as usize)),
            Value::ServerRef(v) => Some(ValueId(Arc::as_ptr(v) as usize)),
            _ => None,
        }
    }

    /// True when both values alias the same storage.
    ///
    /// Scalars never alias; use `==` for those.
    pub fn ptr_eq(a: &Value, b: &Value) -> bool {
        match (a.identity(), b.identity()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }
}

/// Structural equality.
///
/// Numbers compare by IEEE rules (`NaN != NaN`; use [`Value::is_nan`] and
/// [`Value::is_negative_zero`] to inspect those). `Shared` cells compare by
/// their content, so a cell-wrapped value equals its unwrapped twin.
/// Deferred and stream values compare by identity. Comparing a cyclic graph
/// recurses along the cycle; compare identities instead for those.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if let Value::Shared(cell) = self {
            return cell.get() == *other;
        }
        if let Value::Shared(cell) = other {
            return *self == cell.get();
        }
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::Array(a), Value::Array(b)) | (Value::Set(a), Value::Set(b)) => {
                a.ptr_eq(b) || a.snapshot() == b.snapshot()
            }
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b) || a.snapshot() == b.snapshot(),
            (Value::Map(a), Value::Map(b)) => a.ptr_eq(b) || a.snapshot() == b.snapshot(),
            (Value::Blob(a), Value::Blob(b)) => a == b,
            (Value::Form(a), Value::Form(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Deferred(a), Value::Deferred(b)) => a.identity() == b.identity(),
            (Value::Stream(a), Value::Stream(b)) => a.identity() == b.identity(),
            (Value::ClientRef(a), Value::ClientRef(b)) => a == b,
            (Value::ServerRef(a), Value::ServerRef(b)) => a.key() == b.key(),
            (Value::TempRef(a), Value::TempRef(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(f64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Number(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(Arc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(Arc::from(v.as_str()))
    }
}

impl From<i128> for Value {
    fn from(v: i128) -> Self {
        Value::BigInt(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(SharedList::from_vec(v))
    }
}

impl From<Binary> for Value {
    fn from(v: Binary) -> Self {
        Value::Binary(v)
    }
}

impl From<ErrorValue> for Value {
    fn from(v: ErrorValue) -> Self {
        Value::Error(Arc::new(v))
    }
}

impl From<SharedCell> for Value {
    fn from(v: SharedCell) -> Self {
        Value::Shared(v)
    }
}

impl From<DeferredValue> for Value {
    fn from(v: DeferredValue) -> Self {
        Value::Deferred(v)
    }
}

impl From<StreamValue> for Value {
    fn from(v: StreamValue) -> Self {
        Value::Stream(v)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn clones_alias_their_storage() {
        let list = SharedList::from_vec(vec![Value::from(1)]);
        let a = Value::Array(list.clone());
        let b = a.clone();
        list.push(Value::from(2));
        assert_eq!(b.as_array().unwrap().len(), 2);
        assert!(Value::ptr_eq(&a, &b));
    }

    #[test]
    fn shared_cells_compare_transparently() {
        let cell = SharedCell::new(Value::from("x"));
        assert_eq!(Value::from(cell.clone()), Value::from("x"));
        assert_ne!(cell.identity(), SharedCell::new(Value::from("x")).identity());
    }

    #[test]
    fn special_number_accessors() {
        assert!(Value::Number(f64::NAN).is_nan());
        assert!(Value::Number(-0.0).is_negative_zero());
        assert!(!Value::Number(0.0).is_negative_zero());
        // IEEE equality deliberately: -0 == 0, NaN != NaN
        assert_eq!(Value::Number(-0.0), Value::Number(0.0));
        assert_ne!(Value::Number(f64::NAN), Value::Number(f64::NAN));
    }

    #[test]
    fn binary_rejects_ragged_lengths() {
        assert!(Binary::new(BinaryKind::I32, vec![0; 8]).is_ok());
        assert!(Binary::new(BinaryKind::I32, vec![0; 7]).is_err());
    }

    #[test]
    fn record_insert_replaces_in_place() {
        let record = SharedRecord::new();
        record.insert("a", Value::from(1));
        record.insert("b", Value::from(2));
        record.insert("a", Value::from(3));
        let keys: Vec<_> = record
            .snapshot()
            .into_iter()
            .map(|(k, _)| k.to_string())
            .collect();
        assert_eq!(keys, ["a", "b"]);
        assert_eq!(record.get("a"), Some(Value::from(3)));
    }
}
