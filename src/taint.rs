//! Guard rails against serializing secrets.
//!
//! A [`TaintRegistry`] remembers values that must never leave the process,
//! either by content (a secret string, bigint, or byte buffer) or by
//! identity (a particular shared object). The encoder consults the
//! registry at every leaf and every container it visits; a hit aborts the
//! whole session with [`RowcodeError::Tainted`] rather than letting the
//! value reach a row in any form.
//!
//! Tainting by content catches copies: any string equal to the registered
//! one is blocked, wherever it came from. Tainting by identity blocks one
//! allocation and leaves equal-looking values alone.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use std::collections::HashMap;

use crate::error::{Result, RowcodeError};
use crate::value::{Value, ValueId};

#[derive(Debug, Default)]
struct TaintInner {
    texts: HashMap<String, String>,
    bigints: HashMap<i128, String>,
    bytes: HashMap<Vec<u8>, String>,
    identities: HashMap<ValueId, String>,
}

fn lock_taint<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Debug, Clone)]
enum TaintSlot {
    Text(String),
    BigInt(i128),
    Bytes(Vec<u8>),
    Identity(ValueId),
}

/// Removes one taint entry when released.
///
/// Dropping the handle without calling [`release`](TaintHandle::release)
/// leaves the entry in place for the registry's lifetime.
#[derive(Debug)]
#[must_use = "the taint entry stays registered until the handle is released"]
pub struct TaintHandle {
    registry: Weak<Mutex<TaintInner>>,
    slot: TaintSlot,
}

impl TaintHandle {
    /// Unregisters the entry this handle was issued for.
    pub fn release(self) {
        if let Some(inner) = self.registry.upgrade() {
            let mut inner = lock_taint(&inner);
            match self.slot {
                TaintSlot::Text(text) => {
                    inner.texts.remove(&text);
                }
                TaintSlot::BigInt(int) => {
                    inner.bigints.remove(&int);
                }
                TaintSlot::Bytes(bytes) => {
                    inner.bytes.remove(&bytes);
                }
                TaintSlot::Identity(id) => {
                    inner.identities.remove(&id);
                }
            }
        }
    }
}

/// Registry of values barred from serialization.
///
/// Clones share the same entries, so one registry can guard many sessions.
#[derive(Debug, Clone, Default)]
pub struct TaintRegistry {
    inner: Arc<Mutex<TaintInner>>,
}

impl TaintRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks every value with the same content as `value`.
    ///
    /// Only strings, bigints, and binary data have content unique enough
    /// to match by; other kinds are refused. Empty strings and empty
    /// buffers are refused too, since they would match everything.
    pub fn taint_value(&self, message: impl Into<String>, value: &Value) -> Result<TaintHandle> {
        let message = message.into();
        let slot = match value {
            Value::String(text) => {
                if text.is_empty() {
                    return Err(RowcodeError::Tainted(
                        "cannot taint an empty string".into(),
                    ));
                }
                TaintSlot::Text(text.to_string())
            }
            Value::BigInt(int) => TaintSlot::BigInt(*int),
            Value::Binary(binary) => {
                if binary.data().is_empty() {
                    return Err(RowcodeError::Tainted(
                        "cannot taint an empty binary value".into(),
                    ));
                }
                TaintSlot::Bytes(binary.data().to_vec())
            }
            _ => {
                return Err(RowcodeError::Tainted(
                    "only strings, bigints, and binary data can be tainted by content".into(),
                ))
            }
        };
        self.register(message, slot)
    }

    /// Blocks one shared allocation by identity.
    pub fn taint_identity(&self, message: impl Into<String>, value: &Value) -> Result<TaintHandle> {
        let id = value.identity().ok_or_else(|| {
            RowcodeError::Tainted("only values with a shared identity can be tainted".into())
        })?;
        self.register(message.into(), TaintSlot::Identity(id))
    }

    fn register(&self, message: String, slot: TaintSlot) -> Result<TaintHandle> {
        {
            let mut inner = lock_taint(&self.inner);
            match &slot {
                TaintSlot::Text(text) => {
                    inner.texts.insert(text.clone(), message);
                }
                TaintSlot::BigInt(int) => {
                    inner.bigints.insert(*int, message);
                }
                TaintSlot::Bytes(bytes) => {
                    inner.bytes.insert(bytes.clone(), message);
                }
                TaintSlot::Identity(id) => {
                    inner.identities.insert(*id, message);
                }
            }
        }
        Ok(TaintHandle {
            registry: Arc::downgrade(&self.inner),
            slot,
        })
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut inner = lock_taint(&self.inner);
        inner.texts.clear();
        inner.bigints.clear();
        inner.bytes.clear();
        inner.identities.clear();
    }

    /// The registered message for a content match, if `value` is blocked.
    pub(crate) fn check_value(&self, value: &Value) -> Option<String> {
        let inner = lock_taint(&self.inner);
        match value {
            Value::String(text) => inner.texts.get(text.as_ref()).cloned(),
            Value::BigInt(int) => inner.bigints.get(int).cloned(),
            Value::Binary(binary) => inner.bytes.get(binary.data()).cloned(),
            _ => None,
        }
    }

    /// The registered message for an identity match, if any.
    pub(crate) fn check_identity(&self, id: ValueId) -> Option<String> {
        lock_taint(&self.inner).identities.get(&id).cloned()
    }

    pub(crate) fn is_empty(&self) -> bool {
        let inner = lock_taint(&self.inner);
        inner.texts.is_empty()
            && inner.bigints.is_empty()
            && inner.bytes.is_empty()
            && inner.identities.is_empty()
    }
}
