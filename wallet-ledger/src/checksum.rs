//! Integrity checksums for wallets, transactions and transfers
//!
//! Each stamp is an HMAC-SHA256 over a `|`-joined canonical field list,
//! keyed by the deployment secret and hex-encoded:
//!
//! - wallet: `uuid|balance|frozen_amount|transaction_count|transaction_sum`
//! - transaction: `uuid|wallet_id|kind|amount|created_at`
//! - transfer: `uuid|from_id|to_id|amount|fee|created_at`
//!
//! Numbers are canonicalized through the decimal engine, transaction amounts
//! at the engine's default scale, and timestamps are unix seconds.
//!
//! With checksums disabled every stamp is `None` and verification always
//! passes; tampering is then undetectable.

use crate::config::ChecksumConfig;
use crate::math::Math;
use crate::metrics::Metrics;
use crate::types::{Transaction, TransactionKind, Transfer, Wallet, WalletId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// HMAC stamping and verification
#[derive(Clone)]
pub struct ChecksumService {
    key: Option<Vec<u8>>,
    math: Math,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for ChecksumService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print the secret
        f.debug_struct("ChecksumService")
            .field("enabled", &self.is_enabled())
            .field("math", &self.math)
            .finish()
    }
}

impl ChecksumService {
    /// Create from configuration
    pub fn new(config: &ChecksumConfig, math: Math) -> Self {
        let key = config
            .enabled
            .then(|| config.secret.as_bytes().to_vec());
        Self {
            key,
            math,
            metrics: None,
        }
    }

    /// Service that never stamps and never rejects
    pub fn disabled(math: Math) -> Self {
        Self {
            key: None,
            math,
            metrics: None,
        }
    }

    /// Count verification failures in `metrics`
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Whether stamps are computed
    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Stamp for a wallet's persisted state
    pub fn wallet(
        &self,
        uuid: &Uuid,
        balance: &str,
        frozen_amount: &str,
        transaction_count: u64,
        transaction_sum: &str,
    ) -> Result<Option<String>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let fields = self.wallet_fields(uuid, balance, frozen_amount, transaction_count, transaction_sum)?;
        self.stamp(&fields)
    }

    /// Stamp for a transaction
    pub fn transaction(
        &self,
        uuid: &Uuid,
        wallet_id: WalletId,
        kind: TransactionKind,
        amount: &str,
        created_at: &DateTime<Utc>,
    ) -> Result<Option<String>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let fields = self.transaction_fields(uuid, wallet_id, kind, amount, created_at)?;
        self.stamp(&fields)
    }

    /// Stamp for a transfer
    pub fn transfer(
        &self,
        uuid: &Uuid,
        from_id: WalletId,
        to_id: WalletId,
        amount: &str,
        fee: &str,
        created_at: &DateTime<Utc>,
    ) -> Result<Option<String>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let fields = self.transfer_fields(uuid, from_id, to_id, amount, fee, created_at)?;
        self.stamp(&fields)
    }

    /// Check a wallet row against its transaction aggregate
    pub fn verify_wallet(
        &self,
        wallet: &Wallet,
        transaction_count: u64,
        transaction_sum: &str,
    ) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let fields = self.wallet_fields(
            &wallet.uuid,
            &wallet.balance,
            &wallet.frozen_amount,
            transaction_count,
            transaction_sum,
        )?;
        self.verify("wallet", &wallet.uuid, &fields, wallet.checksum.as_deref())
    }

    /// Check a transaction row
    pub fn verify_transaction(&self, transaction: &Transaction) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let fields = self.transaction_fields(
            &transaction.uuid,
            transaction.wallet_id,
            transaction.kind,
            &transaction.amount,
            &transaction.created_at,
        )?;
        self.verify(
            "transaction",
            &transaction.uuid,
            &fields,
            transaction.checksum.as_deref(),
        )
    }

    /// Check a transfer row
    pub fn verify_transfer(&self, transfer: &Transfer) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let fields = self.transfer_fields(
            &transfer.uuid,
            transfer.from_id,
            transfer.to_id,
            &transfer.amount,
            &transfer.fee,
            &transfer.created_at,
        )?;
        self.verify("transfer", &transfer.uuid, &fields, transfer.checksum.as_deref())
    }

    fn wallet_fields(
        &self,
        uuid: &Uuid,
        balance: &str,
        frozen_amount: &str,
        transaction_count: u64,
        transaction_sum: &str,
    ) -> Result<Vec<String>> {
        Ok(vec![
            uuid.to_string(),
            self.math.strip_trailing_zeros(balance)?,
            self.math.strip_trailing_zeros(frozen_amount)?,
            transaction_count.to_string(),
            self.math.strip_trailing_zeros(transaction_sum)?,
        ])
    }

    fn transaction_fields(
        &self,
        uuid: &Uuid,
        wallet_id: WalletId,
        kind: TransactionKind,
        amount: &str,
        created_at: &DateTime<Utc>,
    ) -> Result<Vec<String>> {
        Ok(vec![
            uuid.to_string(),
            wallet_id.to_string(),
            kind.as_str().to_string(),
            self.math.scale(amount, None)?,
            created_at.timestamp().to_string(),
        ])
    }

    fn transfer_fields(
        &self,
        uuid: &Uuid,
        from_id: WalletId,
        to_id: WalletId,
        amount: &str,
        fee: &str,
        created_at: &DateTime<Utc>,
    ) -> Result<Vec<String>> {
        Ok(vec![
            uuid.to_string(),
            from_id.to_string(),
            to_id.to_string(),
            self.math.strip_trailing_zeros(amount)?,
            self.math.strip_trailing_zeros(fee)?,
            created_at.timestamp().to_string(),
        ])
    }

    fn mac(&self, fields: &[String]) -> Result<Option<HmacSha256>> {
        let Some(key) = &self.key else {
            return Ok(None);
        };
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| Error::Config(format!("Invalid checksum secret: {}", e)))?;
        mac.update(fields.join("|").as_bytes());
        Ok(Some(mac))
    }

    fn stamp(&self, fields: &[String]) -> Result<Option<String>> {
        Ok(self
            .mac(fields)?
            .map(|mac| hex::encode(mac.finalize().into_bytes())))
    }

    fn verify(
        &self,
        subject: &str,
        uuid: &Uuid,
        fields: &[String],
        stored: Option<&str>,
    ) -> Result<()> {
        let Some(mac) = self.mac(fields)? else {
            return Ok(());
        };

        let matches = stored
            .and_then(|stored| hex::decode(stored).ok())
            .map_or(false, |bytes| mac.verify_slice(&bytes).is_ok());

        if matches {
            return Ok(());
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_checksum_failure();
        }
        tracing::error!(subject, %uuid, stamped = stored.is_some(), "Checksum mismatch");

        Err(Error::WalletInconsistency(format!(
            "{} {} failed checksum verification",
            subject, uuid
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ChecksumService {
        let config = ChecksumConfig {
            enabled: true,
            secret: "test-secret".to_string(),
        };
        ChecksumService::new(&config, Math::default())
    }

    fn wallet(balance: &str, checksum: Option<String>) -> Wallet {
        Wallet {
            id: 1,
            uuid: Uuid::nil(),
            holder: crate::types::Holder::new("user", "1"),
            name: "Default Wallet".to_string(),
            slug: "default".to_string(),
            description: None,
            decimal_places: 2,
            balance: balance.to_string(),
            frozen_amount: "0".to_string(),
            checksum,
            meta: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn test_disabled_never_stamps() {
        let service = ChecksumService::disabled(Math::default());
        let stamp = service
            .wallet(&Uuid::nil(), "100", "0", 1, "100")
            .unwrap();
        assert_eq!(stamp, None);
        assert!(service.verify_wallet(&wallet("999", None), 0, "0").is_ok());
    }

    #[test]
    fn test_wallet_stamp_is_stable_and_hex() {
        let service = service();
        let a = service.wallet(&Uuid::nil(), "100", "0", 1, "100").unwrap().unwrap();
        let b = service.wallet(&Uuid::nil(), "100.00", "0", 1, "100").unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_every_wallet_field_is_covered() {
        let service = service();
        let base = service.wallet(&Uuid::nil(), "100", "0", 1, "100").unwrap();

        let variants = [
            service.wallet(&Uuid::max(), "100", "0", 1, "100").unwrap(),
            service.wallet(&Uuid::nil(), "101", "0", 1, "100").unwrap(),
            service.wallet(&Uuid::nil(), "100", "1", 1, "100").unwrap(),
            service.wallet(&Uuid::nil(), "100", "0", 2, "100").unwrap(),
            service.wallet(&Uuid::nil(), "100", "0", 1, "101").unwrap(),
        ];
        for variant in variants {
            assert_ne!(variant, base);
        }
    }

    #[test]
    fn test_verify_wallet_detects_tampering() {
        let service = service();
        let stamp = service.wallet(&Uuid::nil(), "500", "0", 2, "500").unwrap();

        let honest = wallet("500", stamp.clone());
        assert!(service.verify_wallet(&honest, 2, "500").is_ok());

        let tampered = wallet("5000", stamp);
        assert!(matches!(
            service.verify_wallet(&tampered, 2, "500"),
            Err(Error::WalletInconsistency(_))
        ));
    }

    #[test]
    fn test_missing_stamp_fails_when_enabled() {
        let service = service();
        assert!(matches!(
            service.verify_wallet(&wallet("0", None), 0, "0"),
            Err(Error::WalletInconsistency(_))
        ));
        assert!(matches!(
            service.verify_wallet(&wallet("0", Some("not-hex".to_string())), 0, "0"),
            Err(Error::WalletInconsistency(_))
        ));
    }

    #[test]
    fn test_different_secret_different_stamp() {
        let other = ChecksumService::new(
            &ChecksumConfig {
                enabled: true,
                secret: "another".to_string(),
            },
            Math::default(),
        );
        let a = service().wallet(&Uuid::nil(), "1", "0", 1, "1").unwrap();
        let b = other.wallet(&Uuid::nil(), "1", "0", 1, "1").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_transaction_round_trip() {
        let service = service();
        let created_at = Utc::now();
        let uuid = Uuid::now_v7();
        let checksum = service
            .transaction(&uuid, 3, TransactionKind::Withdraw, "-250", &created_at)
            .unwrap();

        let mut tx = Transaction {
            id: 1,
            uuid,
            wallet_id: 3,
            kind: TransactionKind::Withdraw,
            amount: "-250".to_string(),
            meta: None,
            checksum,
            created_at,
            updated_at: created_at,
            deleted_at: None,
        };
        assert!(service.verify_transaction(&tx).is_ok());

        // metadata is not covered
        tx.meta = Some(serde_json::json!({"note": "edited"}));
        assert!(service.verify_transaction(&tx).is_ok());

        tx.amount = "-25".to_string();
        assert!(service.verify_transaction(&tx).is_err());
    }

    #[test]
    fn test_checksum_failure_is_counted() {
        let metrics = Metrics::new().unwrap();
        let service = service().with_metrics(metrics.clone());
        let _ = service.verify_wallet(&wallet("1", None), 0, "0");
        assert_eq!(metrics.checksum_failures_total.get(), 1);
    }
}
