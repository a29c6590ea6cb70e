use crate::billing::{BalanceError, BillingError, LedgerError};
use crate::db::errors::DbError;
use crate::recharge::RechargeError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Callback signature missing or invalid
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// Balance row too contended to update within the retry budget
    #[error("Busy: {message}")]
    Busy { message: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),

    /// Conflict error, e.g. a reused request id or a closed order
    #[error("Conflict: {message}")]
    Conflict { message: String },
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Busy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Conflict { .. } => StatusCode::CONFLICT,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::BadRequest { message } => message.clone(),
            Error::NotFound { resource, id } => {
                format!("{resource} with ID {id} not found")
            }
            Error::Busy { message } => message.clone(),
            Error::Internal { .. } => "Internal server error".to_string(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { .. } => "Resource already exists".to_string(),
                DbError::CheckViolation { .. } => "Invalid data provided".to_string(),
                DbError::Other(_) => "Database error occurred".to_string(),
            },
            Error::Other(_) => "Internal server error".to_string(),
            Error::Conflict { message } => message.clone(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Database(DbError::Other(_)) | Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Database(_) | Error::Busy { .. } => {
                tracing::warn!("Storage error: {}", self);
            }
            Error::Unauthenticated { .. } => {
                tracing::info!("Authorization error: {}", self);
            }
            Error::BadRequest { .. } | Error::NotFound { .. } => {
                tracing::debug!("Client error: {}", self);
            }
            Error::Conflict { .. } => {
                tracing::warn!("Conflict error: {}", self);
            }
        }

        let status = self.status_code();
        let body = serde_json::json!({ "message": self.user_message() });
        (status, axum::response::Json(body)).into_response()
    }
}

impl From<BalanceError> for Error {
    fn from(err: BalanceError) -> Self {
        match err {
            BalanceError::UnknownAccount(user_id) => Error::NotFound {
                resource: "Balance".to_string(),
                id: user_id.to_string(),
            },
            BalanceError::InsufficientFunds { .. } | BalanceError::InvalidAmount(_) => Error::BadRequest {
                message: err.to_string(),
            },
            BalanceError::Contention { .. } => Error::Busy {
                message: "Balance is busy, please try again".to_string(),
            },
            BalanceError::FrozenUnderflow { .. } => Error::Internal {
                operation: err.to_string(),
            },
            BalanceError::Storage(db_err) => Error::Database(db_err),
        }
    }
}

impl From<LedgerError> for Error {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(request_id) => Error::NotFound {
                resource: "Freeze record".to_string(),
                id: request_id.to_string(),
            },
            LedgerError::Storage(db_err) => Error::Database(db_err),
            other => Error::Conflict {
                message: other.to_string(),
            },
        }
    }
}

impl From<BillingError> for Error {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::UnknownModel(_) | BillingError::InsufficientBalance { .. } | BillingError::Rejected { .. } => {
                Error::BadRequest {
                    message: err.to_string(),
                }
            }
            BillingError::UnknownAccount(user_id) => Error::NotFound {
                resource: "Balance".to_string(),
                id: user_id.to_string(),
            },
            BillingError::Contention | BillingError::SettlementDeferred(_) => Error::Busy {
                message: err.to_string(),
            },
            BillingError::RequestInFlight(_) | BillingError::RequestIdConflict(_) => Error::Conflict {
                message: err.to_string(),
            },
            BillingError::Inconsistent(_) => Error::Internal {
                operation: err.to_string(),
            },
            BillingError::Storage(db_err) => Error::Database(db_err),
        }
    }
}

impl From<RechargeError> for Error {
    fn from(err: RechargeError) -> Self {
        match err {
            RechargeError::OrderNotFound(order_id) => Error::NotFound {
                resource: "Recharge order".to_string(),
                id: order_id.to_string(),
            },
            RechargeError::UnknownPackage(_)
            | RechargeError::PriceMismatch { .. }
            | RechargeError::InvalidAmount(_)
            | RechargeError::AmountMismatch { .. }
            | RechargeError::OrderExpired(_) => Error::BadRequest {
                message: err.to_string(),
            },
            RechargeError::OrderClosed { .. } | RechargeError::DuplicateTransaction(_) => Error::Conflict {
                message: err.to_string(),
            },
            RechargeError::OrderIdExhausted(_) => Error::Internal {
                operation: err.to_string(),
            },
            RechargeError::Balance(balance_err) => balance_err.into(),
            RechargeError::Storage(db_err) => Error::Database(db_err),
        }
    }
}

/// Convert from String errors (e.g., from external functions)
impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Internal { operation: msg }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    #[test]
    fn test_domain_errors_map_to_statuses() {
        let user_id = Uuid::new_v4();
        assert_eq!(Error::from(BalanceError::UnknownAccount(user_id)).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::from(BalanceError::Contention { user_id, attempts: 5 }).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::from(BalanceError::InsufficientFunds {
                required: Decimal::ONE,
                available: Decimal::ZERO,
            })
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::from(RechargeError::Balance(BalanceError::UnknownAccount(user_id))).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::from(RechargeError::DuplicateTransaction("tx".to_string())).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::from(BillingError::RequestInFlight("r-1".into())).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_internal_errors_hide_details() {
        let err = Error::Internal {
            operation: "reach the database at postgres://secret".to_string(),
        };
        assert_eq!(err.user_message(), "Internal server error");
        let err = Error::Database(DbError::Other(anyhow::anyhow!("connection refused")));
        assert_eq!(err.user_message(), "Database error occurred");
    }
}
