//! Resolution cells for decoded rows.
//!
//! Every row id maps to one [`Chunk`]: a cell that moves monotonically
//! from unresolved, through lazily-parsed, to settled. References between
//! rows attach [`Listener`]s to the cell they wait on; a listener knows
//! which slot of which container to fill once the value exists, so forward
//! references cost one registration instead of a re-walk.

use std::sync::Arc;

use crate::format::RowId;
use crate::modules::ImportMetadata;
use crate::rt::DeferredValue;
use crate::value::{ErrorValue, SharedCell, SharedList, SharedRecord, Value};

/// Key of one resolution cell.
///
/// Wire rows use their row id. Internal cells back values that are not
/// addressable from the wire, like stream items staged for ordered
/// delivery and debug payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ChunkKey {
    Wire(RowId),
    Internal(u32),
}

const INTERNAL_TOKEN_BIT: u32 = 1 << 31;

impl ChunkKey {
    /// Packs the key into a mailbox wake token.
    ///
    /// Wire ids are allocated sequentially from zero and internal ids are
    /// capped below the marker bit, so the two spaces cannot meet.
    pub(crate) fn token(self) -> u32 {
        match self {
            Self::Wire(id) => id.0,
            Self::Internal(n) => n | INTERNAL_TOKEN_BIT,
        }
    }

    pub(crate) fn from_token(token: u32) -> Self {
        if token & INTERNAL_TOKEN_BIT != 0 {
            Self::Internal(token & !INTERNAL_TOKEN_BIT)
        } else {
            Self::Wire(RowId(token))
        }
    }
}

/// Where a resolved reference lands.
///
/// Slots point into shared containers, so filling one mutates the value
/// graph in place and every alias observes the write.
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    ListIndex(SharedList, usize),
    RecordKey(SharedRecord, Arc<str>),
    CellSet(SharedCell),
}

impl Slot {
    pub(crate) fn fill(&self, value: Value) {
        match self {
            Slot::ListIndex(list, index) => {
                // The slot was created while building the list, so the
                // index is always in bounds.
                let _ = list.set(*index, value);
            }
            Slot::RecordKey(record, key) => {
                record.insert(Arc::clone(key), value);
            }
            Slot::CellSet(cell) => cell.set(value),
        }
    }
}

/// Transform applied to a referenced chunk's value at the reference site.
///
/// The row itself stays a plain model; the reference token decides what
/// the bytes mean, so one outlined row can be shared by differently-typed
/// references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shape {
    /// Use the value as-is.
    Model,
    /// An array of `[key, value]` pairs becomes a map.
    MapEntries,
    /// An array of elements becomes a set.
    SetEntries,
    /// `[mimeType, bytes...]` becomes a blob.
    Blob,
    /// An array of `[name, value]` pairs becomes a form payload.
    FormData,
    /// A descriptor object becomes an error value.
    ErrorValue,
    /// A descriptor object becomes a server reference.
    ServerRef,
}

/// A party waiting on a chunk.
#[derive(Debug)]
pub(crate) enum Listener {
    /// Fill `slot` with the shaped value, then unblock the row that was
    /// being initialized when the reference was found.
    Slot {
        slot: Slot,
        shape: Shape,
        blocked: ChunkKey,
    },
    /// Settle a host-visible deferred with the chunk's outcome.
    Bridge(DeferredValue),
    /// Append the value to the debug info of `target`.
    Debug { target: RowId },
    /// Replay the value as a console entry through the log facade.
    Console,
}

/// One resolution cell.
///
/// States only move forward: `Pending` rows gain a payload or an error;
/// parsed rows with unresolved references sit in `Blocked` until their
/// dependency count drains; settled cells never change again.
#[derive(Debug)]
pub(crate) enum Chunk {
    /// No row arrived yet; listeners park here.
    Pending(Vec<Listener>),
    /// The row arrived but nobody needs the value yet; the payload is
    /// kept raw and parsed on first demand.
    ResolvedModel(Vec<u8>),
    /// An import row arrived; the module loads on first demand.
    ResolvedModule(ImportMetadata),
    /// Module code is loading through the host loader.
    PreloadingModule {
        listeners: Vec<Listener>,
        metadata: ImportMetadata,
    },
    /// The model was parsed but `deps` references are still unresolved.
    /// `holder` owns the partially-filled value; slots write through it.
    Blocked {
        listeners: Vec<Listener>,
        deps: u32,
        holder: SharedCell,
        fixups: Vec<(Slot, Shape)>,
    },
    /// Fully resolved.
    Fulfilled(Value),
    /// Failed; the error is shared with every waiter.
    Rejected(Arc<ErrorValue>),
}

impl Chunk {
    /// Listeners parked on an unsettled cell, leaving the cell settled-in
    /// -place with an empty list.
    pub(crate) fn take_listeners(&mut self) -> Vec<Listener> {
        match self {
            Chunk::Pending(listeners)
            | Chunk::PreloadingModule { listeners, .. }
            | Chunk::Blocked { listeners, .. } => std::mem::take(listeners),
            _ => Vec::new(),
        }
    }

    pub(crate) fn is_settled(&self) -> bool {
        matches!(self, Chunk::Fulfilled(_) | Chunk::Rejected(_))
    }
}

/// Public read of one cell, as seen through [`Response::read`].
///
/// [`Response::read`]: crate::decode::Response::read
#[derive(Debug, Clone)]
pub enum ChunkRead {
    /// The value is fully resolved.
    Ready(Value),
    /// The row has not arrived, or it still waits on other rows.
    Pending,
    /// The row failed, or the session closed before it resolved.
    Failed(Arc<ErrorValue>),
}

impl ChunkRead {
    /// The value, if ready.
    pub fn ready(self) -> Option<Value> {
        match self {
            ChunkRead::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// True while the cell is neither ready nor failed.
    pub fn is_pending(&self) -> bool {
        matches!(self, ChunkRead::Pending)
    }
}
