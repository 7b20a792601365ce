//! Module references and the bundler seam.
//!
//! A value graph may point at code, not just data. A [`ClientReference`]
//! names a module export that the receiving side must load through its own
//! bundler; a [`ServerReference`] names a callable that stays behind and is
//! invoked by key. The codec never loads code itself: the encode side asks
//! a [`ModuleManifest`] to translate reference keys into portable
//! [`ImportMetadata`], and the decode side hands that metadata to a
//! [`ModuleLoader`] supplied by the host.
//!
//! [`TemporaryReferenceSet`] covers the opposite case: values that must not
//! cross the wire at all, but must survive a round trip by identity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;

use crate::error::{Result, RowcodeError};
use crate::format::RowId;
use crate::value::{Value, ValueId};

// --- CLIENT REFERENCES ---

/// A named module export to be loaded by the receiving side.
///
/// The key is bundler-facing, conventionally `"<module path>#<export>"`.
/// Equality is by key: two references to the same export are one module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientReference {
    key: Arc<str>,
}

impl ClientReference {
    /// A reference to the export named by `key`.
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self { key: key.into() }
    }

    /// The bundler-facing key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// A callable left on the sending side, invoked by key.
///
/// May carry bound arguments captured ahead of the call; `bound` is
/// usually an array, or a deferred that settles to one.
#[derive(Debug, Clone)]
pub struct ServerReference {
    key: Arc<str>,
    bound: Option<Value>,
}

impl ServerReference {
    /// A reference to the callable named by `key`, with nothing bound.
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self {
            key: key.into(),
            bound: None,
        }
    }

    /// Attaches bound arguments.
    pub fn with_bound(mut self, bound: Value) -> Self {
        self.bound = Some(bound);
        self
    }

    /// The callable's key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Bound arguments, if any were captured.
    pub fn bound(&self) -> Option<&Value> {
        self.bound.as_ref()
    }
}

// --- IMPORT METADATA ---

/// Portable description of how to load one module export.
///
/// Travels as an import row payload, a JSON array of the form
/// `[moduleId, chunks, exportName]` with `true` appended for async
/// modules. Kept positional so unknown later elements are tolerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportMetadata {
    /// Bundler module id.
    pub module_id: String,
    /// Code-split chunks that must load before the module can run.
    pub chunks: Vec<String>,
    /// Which export of the module is referenced.
    pub export_name: String,
    /// Whether the module resolves asynchronously after evaluation.
    pub is_async: bool,
}

impl ImportMetadata {
    /// Metadata for a synchronous export with no extra chunks.
    pub fn new(
        module_id: impl Into<String>,
        chunks: Vec<String>,
        export_name: impl Into<String>,
    ) -> Self {
        Self {
            module_id: module_id.into(),
            chunks,
            export_name: export_name.into(),
            is_async: false,
        }
    }

    /// Marks the module async.
    pub fn into_async(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        if self.is_async {
            json!([self.module_id, self.chunks, self.export_name, true])
        } else {
            json!([self.module_id, self.chunks, self.export_name])
        }
    }

    pub(crate) fn from_json(raw: &serde_json::Value) -> Result<Self> {
        let parts = raw
            .as_array()
            .ok_or_else(|| RowcodeError::Format("import metadata must be an array".into()))?;
        let module_id = parts
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| RowcodeError::Format("import metadata is missing a module id".into()))?;
        let chunks = parts
            .get(1)
            .and_then(|v| v.as_array())
            .ok_or_else(|| RowcodeError::Format("import metadata is missing a chunk list".into()))?
            .iter()
            .map(|c| {
                c.as_str().map(str::to_owned).ok_or_else(|| {
                    RowcodeError::Format("import metadata chunk names must be strings".into())
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let export_name = parts.get(2).and_then(|v| v.as_str()).ok_or_else(|| {
            RowcodeError::Format("import metadata is missing an export name".into())
        })?;
        let is_async = parts.get(3).and_then(|v| v.as_bool()).unwrap_or(false);
        Ok(Self {
            module_id: module_id.to_owned(),
            chunks,
            export_name: export_name.to_owned(),
            is_async,
        })
    }
}

// --- MANIFEST AND LOADER ---

/// Encode-side lookup from reference keys to load instructions.
///
/// Returning `None` is a recoverable failure: the encoder replaces that
/// position with an error reference instead of abandoning the session.
pub trait ModuleManifest {
    /// Translates a [`ClientReference`] key for the receiving bundler.
    fn resolve(&self, key: &str) -> Option<ImportMetadata>;
}

/// Decode-side module loading, supplied by the host bundler.
pub trait ModuleLoader {
    /// Starts loading the chunks behind `metadata`.
    ///
    /// Returns a deferred that settles when the code is ready, or `None`
    /// when everything is already loaded.
    fn preload(&self, metadata: &ImportMetadata) -> Option<crate::rt::DeferredValue>;

    /// Produces the referenced export. Called only after `preload` settles.
    fn require(&self, metadata: &ImportMetadata) -> Result<Value>;
}

/// In-memory [`ModuleManifest`] backed by a map.
#[derive(Debug, Default)]
pub struct ModuleMap {
    entries: HashMap<String, ImportMetadata>,
}

impl ModuleMap {
    /// An empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one reference key.
    pub fn insert(&mut self, key: impl Into<String>, metadata: ImportMetadata) {
        self.entries.insert(key.into(), metadata);
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no keys are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ModuleManifest for ModuleMap {
    fn resolve(&self, key: &str) -> Option<ImportMetadata> {
        self.entries.get(key).cloned()
    }
}

// --- TEMPORARY REFERENCES ---

fn lock_refs<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Debug, Default)]
struct TempRefsInner {
    by_identity: HashMap<ValueId, u32>,
    entries: Vec<Value>,
}

/// Round-trip registry for values that must not be serialized.
///
/// The host adds a value before encoding; the encoder writes only an
/// opaque slot key for it. Decoding with the same set swaps the key back
/// for the original value, identity intact. Nothing about the value ever
/// reaches the wire.
#[derive(Debug, Clone, Default)]
pub struct TemporaryReferenceSet {
    inner: Arc<Mutex<TempRefsInner>>,
}

impl TemporaryReferenceSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `value` for round-tripping by identity.
    ///
    /// Values without a shared identity (plain scalars) cannot be tracked
    /// and are refused.
    pub fn add(&self, value: &Value) -> Result<()> {
        let id = value.identity().ok_or_else(|| {
            RowcodeError::Serialization(
                "only values with a shared identity can be kept as temporary references".into(),
            )
        })?;
        let mut inner = lock_refs(&self.inner);
        if !inner.by_identity.contains_key(&id) {
            let slot = inner.entries.len() as u32;
            inner.by_identity.insert(id, slot);
            inner.entries.push(value.clone());
        }
        Ok(())
    }

    /// The slot key for a registered value, as written on the wire.
    pub(crate) fn claim(&self, value: &Value) -> Option<String> {
        let id = value.identity()?;
        let inner = lock_refs(&self.inner);
        inner.by_identity.get(&id).map(|slot| RowId(*slot).to_hex())
    }

    /// Resolves a wire key back to the registered value.
    pub(crate) fn resolve(&self, key: &str) -> Option<Value> {
        let slot = RowId::from_hex(key).ok()?;
        let inner = lock_refs(&self.inner);
        inner.entries.get(slot.0 as usize).cloned()
    }

    /// Number of registered values.
    pub fn len(&self) -> usize {
        lock_refs(&self.inner).entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        lock_refs(&self.inner).entries.is_empty()
    }
}
