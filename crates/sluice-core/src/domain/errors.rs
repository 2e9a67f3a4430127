//! Errors - error types and their operational classification.

use thiserror::Error;

use super::ids::RecordId;

/// ErrorKind is how an error is handled operationally.
///
/// - Transient: retried (record left eligible, or entries kept pending).
/// - Terminal: the record is parked for an operator (retry cap exceeded).
/// - ResourceExhausted: escalated; the process is degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Terminal,
    ResourceExhausted,
}

/// Ledger (store) errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("ledger is closed")]
    Closed,

    #[error("record not found: {0}")]
    NotFound(RecordId),
}

/// Broker errors, surfaced per record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("broker rejected message: {0}")]
    Rejected(String),

    #[error("could not encode message: {0}")]
    Encode(String),

    #[error("broker did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("broker client pool is closed")]
    PoolClosed,

    #[error("send abandoned during drain")]
    Abandoned,
}

impl BrokerError {
    /// Short code stored in the record's `error_code` column.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::Connection(_) => "broker_connection",
            BrokerError::Rejected(_) => "broker_rejected",
            BrokerError::Encode(_) => "encode_failed",
            BrokerError::Timeout(_) => "broker_timeout",
            BrokerError::PoolClosed => "pool_closed",
            BrokerError::Abandoned => "send_abandoned",
        }
    }
}

/// Status coalescer errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoalescerError {
    #[error("pending status updates reached the hard cap ({pending}/{cap})")]
    PendingOverflow { pending: usize, cap: usize },

    #[error("status coalescer is closed")]
    Closed,

    #[error("{remaining} status updates could not be flushed")]
    Unflushed { remaining: usize },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Umbrella error for the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Coalescer(#[from] CoalescerError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("dispatcher is missing a required component: {0}")]
    MissingComponent(&'static str),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Ledger(LedgerError::Closed) => ErrorKind::Terminal,
            DispatchError::Ledger(_) => ErrorKind::Transient,
            DispatchError::Broker(BrokerError::Encode(_)) => ErrorKind::Terminal,
            DispatchError::Broker(_) => ErrorKind::Transient,
            DispatchError::Coalescer(CoalescerError::PendingOverflow { .. }) => {
                ErrorKind::ResourceExhausted
            }
            DispatchError::Coalescer(CoalescerError::Ledger(_)) => ErrorKind::Transient,
            DispatchError::Coalescer(_) => ErrorKind::Terminal,
            DispatchError::Config(_) | DispatchError::MissingComponent(_) => ErrorKind::Terminal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_escalates_as_resource_exhaustion() {
        let err = DispatchError::from(CoalescerError::PendingOverflow { pending: 10, cap: 10 });
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(err.to_string().contains("hard cap"));
    }

    #[test]
    fn broker_and_store_failures_are_transient() {
        assert_eq!(
            DispatchError::from(BrokerError::Connection("reset".into())).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            DispatchError::from(LedgerError::Unavailable("timeout".into())).kind(),
            ErrorKind::Transient
        );
    }

    #[test]
    fn broker_error_codes_are_stable() {
        assert_eq!(BrokerError::Connection("x".into()).code(), "broker_connection");
        assert_eq!(BrokerError::Abandoned.code(), "send_abandoned");
    }
}
