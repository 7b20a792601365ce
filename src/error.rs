//! Centralized error handling for Rowcode.
//!
//! This module provides a robust error handling system that strictly avoids panics,
//! ensuring that all failure conditions are properly propagated through the `Result` type.
//!
//! ## Design Philosophy
//!
//! Rowcode's error handling is designed with the following principles:
//!
//! 1. **No Panics:** All error conditions are represented as `Result` values. The library
//!    enforces this through `#![deny(clippy::panic)]` and `#![deny(clippy::unwrap_used)]`.
//!
//! 2. **Two error planes:** [`RowcodeError`] is the *transport/protocol* plane,
//!    returned from API calls when the codec itself cannot continue (malformed framing,
//!    sink failures, misuse of a closed session). Failures of a *single value subtree*
//!    travel on the wire as error rows instead and surface as rejected chunks carrying an
//!    [`ErrorValue`](crate::value::ErrorValue); they are never `Err` results. See the
//!    error taxonomy notes on [`crate::encode::Request`].
//!
//! 3. **Error Chaining:** Where possible, errors preserve the underlying cause through
//!    the `source()` method, enabling full error traces.
//!
//! 4. **Cloneable Errors:** The [`RowcodeError`] type is `Clone`, allowing errors to be
//!    stored in resolution cells and handed to every listener of a failed chunk.
//!
//! ## Error Categories
//!
//! - **I/O Errors** ([`RowcodeError::Io`]): failures raised by a byte sink
//! - **Serialization Errors** ([`RowcodeError::Serialization`]): JSON payload encoding/decoding
//! - **Format Errors** ([`RowcodeError::Format`]): malformed row framing or reference tokens
//! - **Resolution Errors** ([`RowcodeError::Resolve`]): module/reference lookups that failed
//! - **Taint Violations** ([`RowcodeError::Tainted`]): values registered as never-serializable
//! - **Closed** ([`RowcodeError::Closed`]): operations on an already-terminated session
//! - **Deadlock** ([`RowcodeError::Deadlock`]): a synchronous drive that can never finish
//! - **Internal Errors** ([`RowcodeError::Internal`]): logic errors (should not occur in production)
//!
//! ## Usage Patterns
//!
//! ### Basic Error Handling
//!
//! ```rust
//! use rowcode::{Rowcode, RowcodeError, Value};
//!
//! match Rowcode::decode_from_slice(b"0:not valid json\n") {
//!     Ok(value) => println!("Decoded: {value:?}"),
//!     Err(RowcodeError::Serialization(msg)) => eprintln!("Bad payload: {msg}"),
//!     Err(e) => eprintln!("Other error: {e}"),
//! }
//! ```
//!
//! ### Error Propagation with `?`
//!
//! ```rust
//! use rowcode::{Rowcode, Value};
//!
//! fn ship(value: Value) -> rowcode::Result<Vec<u8>> {
//!     let bytes = Rowcode::encode_to_vec(value)?;
//!     Ok(bytes)
//! }
//! # let _ = ship(Value::from("hello"));
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;

/// A specialized `Result` type for Rowcode operations.
///
/// This type alias is used throughout the library to simplify error handling.
/// It is equivalent to `std::result::Result<T, RowcodeError>`.
///
/// ## Examples
///
/// ```rust
/// use rowcode::Result;
///
/// fn my_function() -> Result<i32> {
///     Ok(42)
/// }
/// ```
pub type Result<T> = std::result::Result<T, RowcodeError>;

/// The master error enum covering all failure domains in Rowcode.
///
/// Each variant corresponds to a specific failure domain and contains contextual
/// information about the error.
///
/// ## Cloneability
///
/// This type is `Clone` so a single failure can be delivered to every listener of a
/// rejected resolution cell. I/O errors are wrapped in `Arc` to make cloning efficient.
///
/// ## Examples
///
/// ```rust
/// use rowcode::RowcodeError;
///
/// fn check_error(err: &RowcodeError) {
///     match err {
///         RowcodeError::Io(e) => println!("I/O error: {e}"),
///         RowcodeError::Format(msg) => println!("Bad framing: {msg}"),
///         _ => println!("Other error"),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub enum RowcodeError {
    /// Low-level I/O failure raised by the output sink (disk full, broken pipe, etc.).
    ///
    /// The underlying `io::Error` is wrapped in an `Arc` to make the error `Clone`.
    Io(Arc<io::Error>),

    /// JSON payload encoding or decoding failure.
    ///
    /// Raised when a row payload cannot be composed into JSON text or a received model
    /// row does not parse as JSON. The string contains the underlying parser message.
    Serialization(String),

    /// The wire data violates the row framing grammar.
    ///
    /// ## Common Causes
    ///
    /// - A non-hex byte inside a row id or length field
    /// - A length-delimited row whose declared length disagrees with its element width
    /// - A reference token pointing at a structurally impossible target
    /// - Trailing garbage after the final row
    Format(String),

    /// A module or function reference could not be resolved.
    ///
    /// Raised when the encode-side manifest has no entry for a client reference, when
    /// the decode side receives an import row without a loader installed, or when a
    /// form-field decode is missing the field a reference points at.
    Resolve(String),

    /// A value registered in the taint registry reached the serializer.
    ///
    /// Taint violations are unconditionally fatal: the whole request errors and nothing
    /// of the offending value is placed on the wire, not even partially.
    Tainted(String),

    /// The session has already terminated and cannot accept further work.
    ///
    /// Returned when pushing bytes into a closed response or polling an encode session
    /// whose stream was fatally closed.
    Closed(String),

    /// A synchronous drive (`encode_to_vec` and friends) stalled on values that can
    /// never settle because no external producer remains to settle them.
    Deadlock(String),

    /// Logic error in the scheduler or resolution graph.
    ///
    /// This error should not occur in production. If you encounter this error, it likely
    /// indicates a bug in the library. Please report it with a minimal reproduction case.
    ///
    /// ## Common Causes (all indicate bugs)
    ///
    /// - Mutex poisoning
    /// - A task id missing from the session that allocated it
    /// - A chunk transitioning out of a terminal state
    Internal(String),
}

impl fmt::Display for RowcodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O Error: {e}"),
            Self::Serialization(s) => write!(f, "Serialization Error: {s}"),
            Self::Format(s) => write!(f, "Wire Format Error: {s}"),
            Self::Resolve(s) => write!(f, "Resolution Error: {s}"),
            Self::Tainted(s) => write!(f, "Taint Violation: {s}"),
            Self::Closed(s) => write!(f, "Session Closed: {s}"),
            Self::Deadlock(s) => write!(f, "Deadlock: {s}"),
            Self::Internal(s) => write!(f, "Internal Logic Error: {s}"),
        }
    }
}

impl std::error::Error for RowcodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RowcodeError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for RowcodeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
