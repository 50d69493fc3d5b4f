//! Crate-wide error taxonomy for the broker.
//!
//! Every fallible operation inside the Manager and Session returns `Result<T, BrokerError>`.
//! The Session's dispatch loop is the single place that maps a `BrokerError` onto either an
//! ERROR wire frame or a `success:false` response field.

use thiserror::Error;

use crate::catalog::ItemName;

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("unknown seller: {seller_id}")]
    UnknownSeller { seller_id: String },

    #[error("unknown item: {0}")]
    UnknownItem(String),

    #[error("insufficient stock of {item} for seller {seller_id}: requested {requested}, available {available}")]
    InsufficientStock {
        seller_id: String,
        item: ItemName,
        requested: f64,
        available: f64,
    },

    #[error("sale not found: {sale_id}")]
    SaleNotFound { sale_id: String },

    #[error("sale is sold out or already closed: {sale_id}")]
    SaleExpired { sale_id: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("malformed frame: {0}")]
    ProtocolError(String),

    #[error("role {role} may not perform {action}")]
    RoleViolation { role: String, action: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Human-readable reason suitable for the `error` field of an ERROR frame.
    pub fn wire_message(&self) -> String {
        self.to_string()
    }

    /// Whether this error terminates the connection (framing violations) or is answered
    /// in-band while the session continues (everything else in the taxonomy).
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::ProtocolError(_) | BrokerError::Transport(_))
    }
}
