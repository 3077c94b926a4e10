use std::io;

use thiserror::Error;

use crate::block::BlockState;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the kernel and the standard blocks.
///
/// Hot-path conditions (no data on a read, a dropped sample on a full
/// ring) are *values*, not errors: reads return `Ok(0)` and drops are
/// accounted on the `overruns` port.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The referenced block does not fit the operation.
    #[error("invalid block")]
    InvalidBlock,

    /// The referenced port does not fit the operation.
    #[error("invalid port")]
    InvalidPort,

    /// A configuration value violates the block's config schema.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A configuration value violates its declared length bounds.
    #[error("invalid config length: {0}")]
    InvalidConfigLen(String),

    /// A type name did not resolve, or a type descriptor is malformed.
    #[error("invalid type: {0}")]
    InvalidType(String),

    /// A computation block was used where an interaction was required,
    /// or vice versa.
    #[error("invalid block type")]
    InvalidBlockType,

    /// A port's declared type does not resolve to a registered type.
    #[error("invalid port type")]
    InvalidPortType,

    /// The port direction does not allow the operation.
    #[error("invalid port direction")]
    InvalidPortDir,

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// A lifecycle operation was attempted outside the
    /// `Preinit -> Inactive -> Active` line graph.
    #[error("{op}: wrong state {found} (expected {expected})")]
    WrongState {
        op: &'static str,
        expected: BlockState,
        found: BlockState,
    },

    #[error("no such entity: {0}")]
    NoSuchEntity(String),

    #[error("already registered: {0}")]
    AlreadyRegistered(String),

    #[error("entity exists: {0}")]
    EntityExists(String),

    #[error("module already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("module init failed: {0}")]
    ModuleInitFailed(String),

    /// A typed operation was attempted with a value of the wrong type.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}
