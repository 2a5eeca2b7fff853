//! Error handling for the election portal

use crate::types::{CandidateId, OfficeId, VoterId};

/// Result type alias for the election portal
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the election portal
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Unknown location, office, candidate, voter or session id
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The voter has already cast a ballot
    #[error("Voter {voter_id} has already voted")]
    AlreadyVoted { voter_id: VoterId },

    /// Selections do not cover exactly the offices the voter may vote for
    #[error("Incomplete ballot: missing {missing:?}, unexpected {unexpected:?}")]
    IncompleteBallot {
        missing: Vec<OfficeId>,
        unexpected: Vec<OfficeId>,
    },

    /// A selected candidate is not on the voter's eligible list for the office
    #[error("Candidate {candidate_id} is not eligible for office {office_id}")]
    IneligibleCandidate {
        office_id: OfficeId,
        candidate_id: CandidateId,
    },

    /// Lost the race for the voter's has-voted flag
    #[error("Atomic update conflict for voter {voter_id}")]
    AtomicUpdateConflict { voter_id: VoterId },

    /// Tally increment retry budget exhausted
    #[error("Tally contention on candidate {candidate_id} after {attempts} attempts")]
    TallyContention {
        candidate_id: CandidateId,
        attempts: u32,
    },

    /// Confirmation could not be delivered
    #[error("Notification failed: {message}")]
    NotificationFailure { message: String },

    /// Store could not be reached or timed out
    #[error("Store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// Reference data breaks a structural invariant
    #[error("Invalid reference data: {message}")]
    InvalidReference { message: String },

    /// Unknown, expired or mismatched session
    #[error("Session error: {message}")]
    Session { message: String },

    /// Validation errors
    #[error("Validation failed: {field}")]
    Validation { field: String },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reading reference files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Create a new not-found error
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Create a new store-unavailable error
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Create a new reference-data error
    pub fn invalid_reference(message: impl Into<String>) -> Self {
        Self::InvalidReference {
            message: message.into(),
        }
    }

    /// Create a new session error
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation(field: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
        }
    }

    /// Create a new notification error
    pub fn notification(message: impl Into<String>) -> Self {
        Self::NotificationFailure {
            message: message.into(),
        }
    }

    /// Create a new internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the caller may safely retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. }
                | Self::TallyContention { .. }
                | Self::NotificationFailure { .. }
                | Self::Internal { .. }
                | Self::Io(_)
        )
    }

    /// Message safe to show to an end user
    ///
    /// Rejections caused by the voter's own input are explicit. Everything
    /// else collapses into a generic retry message so store internals never
    /// reach the client.
    pub fn user_message(&self) -> String {
        match self {
            Self::AlreadyVoted { .. } | Self::AtomicUpdateConflict { .. } => {
                "You have already voted. Each voter may cast one ballot.".to_string()
            }
            Self::IncompleteBallot { missing, .. } if !missing.is_empty() => format!(
                "Your ballot is incomplete: select a candidate for every position ({} missing).",
                missing.len()
            ),
            Self::IncompleteBallot { .. } => {
                "Your ballot contains a position you cannot vote for.".to_string()
            }
            Self::IneligibleCandidate { .. } => {
                "One of your selections is not on the ballot for your location.".to_string()
            }
            Self::NotFound { kind, .. } => format!("The requested {kind} does not exist."),
            Self::Session { .. } => "Your session has expired. Please sign in again.".to_string(),
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}

/// Convenience macros for creating specific error types
#[macro_export]
macro_rules! store_error {
    ($msg:expr) => {
        $crate::Error::store_unavailable($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::store_unavailable(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! reference_error {
    ($msg:expr) => {
        $crate::Error::invalid_reference($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::invalid_reference(format!($fmt, $($arg)*))
    };
}
