//! Error types for the wallet ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
///
/// The first five variants are domain conditions and reach the caller
/// unchanged. Everything else is infrastructure and gets re-wrapped as
/// [`Error::TransactionFailed`] at the host transaction boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Non-positive, non-integral or malformed amount, or division by zero
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Withdrawal attempted against a zero balance
    #[error("Balance of wallet {wallet} is empty")]
    BalanceIsEmpty {
        /// Wallet UUID
        wallet: String,
    },

    /// Withdrawal exceeds the available balance
    #[error("Insufficient funds in wallet {wallet}: available {available}, requested {requested}")]
    InsufficientFunds {
        /// Wallet UUID
        wallet: String,
        /// Effective available balance (raw)
        available: String,
        /// Requested amount (raw)
        requested: String,
    },

    /// Entity lookup miss, or cache miss unresolved after store fallback
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// Checksum mismatch between persisted values and their stamp
    #[error("Wallet inconsistency: {0}")]
    WalletInconsistency(String),

    /// Unexpected failure during a host transaction (includes lock timeouts)
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// Record store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl Error {
    /// Domain conditions are surfaced to callers as-is
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            Error::InvalidAmount(_)
                | Error::BalanceIsEmpty { .. }
                | Error::InsufficientFunds { .. }
                | Error::RecordNotFound(_)
                | Error::WalletInconsistency(_)
        )
    }

    /// Wrap anything outside the domain taxonomy as `TransactionFailed`
    pub fn into_transaction_failure(self) -> Self {
        match self {
            err @ Error::TransactionFailed(_) => err,
            err if err.is_domain() => err,
            err => Error::TransactionFailed(err.to_string()),
        }
    }

    pub(crate) fn invalid_amount(value: &str) -> Self {
        Error::InvalidAmount(format!("'{}'", value))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(format!("Failed to parse config: {}", err))
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Metrics(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_pass_through() {
        let err = Error::BalanceIsEmpty {
            wallet: "w".to_string(),
        };
        assert_eq!(err.clone().into_transaction_failure(), err);

        let err = Error::WalletInconsistency("w".to_string());
        assert_eq!(err.clone().into_transaction_failure(), err);
    }

    #[test]
    fn test_infrastructure_errors_are_wrapped() {
        let err = Error::Storage("disk full".to_string()).into_transaction_failure();
        assert_eq!(
            err,
            Error::TransactionFailed("Storage error: disk full".to_string())
        );

        // no double wrapping
        let again = err.clone().into_transaction_failure();
        assert_eq!(again, err);
    }

    #[test]
    fn test_display() {
        let err = Error::InsufficientFunds {
            wallet: "abc".to_string(),
            available: "500".to_string(),
            requested: "600".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Insufficient funds in wallet abc: available 500, requested 600"
        );
    }
}
