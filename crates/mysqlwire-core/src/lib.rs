//! Core types shared by the mysqlwire crates.
//!
//! - [`Error`] and its per-kind structs, the failure taxonomy of the engine
//! - [`Value`], a dynamically typed SQL value as decoded from the wire
//! - [`Row`] and [`ColumnInfo`] for result rows
//! - `Outcome` and `Cx` re-exported from asupersync for the async presentation

pub use asupersync::{Budget, Cx, Outcome};

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    AuthErrorKind, AuthenticationError, ConfigError, DataError, Error, ProtocolError, Result,
    ServerError, ServerErrorKind, TransportError, TransportErrorKind, UsageError, UsageErrorKind,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
