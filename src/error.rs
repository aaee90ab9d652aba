//! Error types shared by the queue core and its store adapters.
//!
//! Three layers:
//! - [`ValidationError`]: local, pre-write input problems
//! - [`StoreError`]: what a [`DataStore`](crate::store::DataStore) reports,
//!   classified by the Postgres/PostgREST error code it carries
//! - [`QueueError`]: what callers of the core see; its `Display` text is
//!   meant to be shown to staff as-is

use thiserror::Error;

use crate::models::VehicleStatus;
use crate::store::Table;

/// Postgres `insufficient_privilege`.
pub const PG_PERMISSION_DENIED: &str = "42501";
/// Postgres `undefined_table`.
pub const PG_UNDEFINED_TABLE: &str = "42P01";
/// PostgREST "relation not found in schema cache".
pub const PGRST_TABLE_NOT_FOUND: &str = "PGRST205";
/// Postgres `unique_violation`.
pub const PG_UNIQUE_VIOLATION: &str = "23505";

/// A failed input check. Carries the message to show next to the form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    PermissionDenied,
    TableNotFound,
    UniqueViolation,
    Network,
    Decode,
    Other,
}

/// Structured error returned by every [`DataStore`](crate::store::DataStore)
/// operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub code: Option<String>,
    pub message: String,
}

impl StoreError {
    /// Build an error from a machine-readable code, classifying it.
    pub fn from_code(code: Option<&str>, message: impl Into<String>) -> Self {
        let kind = match code {
            Some(PG_PERMISSION_DENIED) => StoreErrorKind::PermissionDenied,
            Some(PG_UNDEFINED_TABLE) | Some(PGRST_TABLE_NOT_FOUND) => StoreErrorKind::TableNotFound,
            Some(PG_UNIQUE_VIOLATION) => StoreErrorKind::UniqueViolation,
            _ => StoreErrorKind::Other,
        };
        Self {
            kind,
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Network,
            code: None,
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Decode,
            code: None,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Other,
            code: None,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue errors
// ---------------------------------------------------------------------------

/// Errors surfaced by [`QueueCore`](crate::queue::QueueCore) operations.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Plate {plate} is already in the active queue")]
    DuplicatePlate { plate: String },

    #[error("You do not have permission to make this change")]
    PermissionDenied,

    #[error("The {table} table is missing from the database. Please contact support")]
    TableMissing { table: String },

    #[error("Cannot move a vehicle from {from} to {to}")]
    InvalidTransition {
        from: VehicleStatus,
        to: VehicleStatus,
    },

    #[error("{entity} {id} was not found")]
    NotFound { entity: &'static str, id: String },

    #[error("The status change to completed could not be confirmed. Please try again")]
    VerificationFailed,

    #[error("{message}")]
    Store {
        kind: StoreErrorKind,
        message: String,
    },
}

pub type QueueResult<T> = Result<T, QueueError>;

impl QueueError {
    /// Map a store error into the domain message shown to staff.
    ///
    /// `plate` is the plate being written, if any, so that a unique
    /// violation can name it.
    pub fn from_store(table: Table, err: StoreError, plate: Option<&str>) -> Self {
        match err.kind {
            StoreErrorKind::PermissionDenied => QueueError::PermissionDenied,
            StoreErrorKind::TableNotFound => QueueError::TableMissing {
                table: table.as_str().to_string(),
            },
            StoreErrorKind::UniqueViolation => match plate {
                Some(plate) => QueueError::DuplicatePlate {
                    plate: plate.to_string(),
                },
                None => QueueError::Store {
                    kind: StoreErrorKind::UniqueViolation,
                    message: "A record with the same details already exists".to_string(),
                },
            },
            kind => {
                let message = if err.message.trim().is_empty() {
                    "Something went wrong while saving. Please try again".to_string()
                } else {
                    err.message
                };
                QueueError::Store { kind, message }
            }
        }
    }

    /// Only transient infrastructure failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::VerificationFailed => true,
            QueueError::Store { kind, .. } => {
                matches!(kind, StoreErrorKind::Network | StoreErrorKind::Other)
            }
            _ => false,
        }
    }
}
