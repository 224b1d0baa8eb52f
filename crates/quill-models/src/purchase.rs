//! Token purchase transaction data models.
//!
//! Purchases move money-for-tokens through a three-phase lifecycle:
//!
//! ```text
//! pending/processing --(confirm)--> completed  [terminal]
//! pending/processing --(cancel)---> failed     [terminal]
//! completed --(external refund)---> refunded   [terminal]
//! ```

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payment lifecycle state of a purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    /// Returns the status as a string for storage and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    /// Parse from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }

    /// Completed and refunded admit no further status change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Refunded)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A token purchase transaction.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PurchaseTransaction {
    /// Row identifier (UUID).
    pub id: Uuid,

    /// Globally unique transaction identifier, generated at creation.
    pub transaction_id: Uuid,

    /// Idempotency key; a retried initiate with the same key returns
    /// this transaction instead of creating a duplicate.
    pub idempotency_key: String,

    /// Purchasing user.
    pub user_id: String,

    /// Tokens credited to the quota account on completion.
    pub tokens_purchased: i64,

    /// Amount paid, in minor currency units (cents).
    pub amount_paid_cents: i64,

    /// ISO 4217 currency code.
    pub currency: String,

    /// External payment processor identifier.
    pub payment_provider: String,

    /// Payment processor reference, set once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,

    /// Lifecycle state.
    pub payment_status: PaymentStatus,

    /// In-flight lock flag; at most one true per user at any time.
    pub is_processing: bool,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PurchaseTransaction {
    /// Whether the purchase can still be confirmed.
    pub fn can_complete(&self) -> bool {
        self.is_processing
            && matches!(
                self.payment_status,
                PaymentStatus::Pending | PaymentStatus::Processing
            )
    }
}

/// Key used to locate a purchase transaction.
///
/// Payment webhooks identify purchases by whichever reference they
/// hold, so all three lookups resolve to the same row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseLookup {
    /// By row identifier.
    PurchaseId(Uuid),
    /// By the globally unique transaction identifier.
    TransactionId(Uuid),
    /// By the external payment processor reference.
    PaymentId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            PaymentStatus::Pending,
            PaymentStatus::Processing,
            PaymentStatus::Completed,
            PaymentStatus::Failed,
            PaymentStatus::Refunded,
        ] {
            assert_eq!(PaymentStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(PaymentStatus::from_str("chargeback"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(PaymentStatus::Completed.is_terminal());
        assert!(PaymentStatus::Refunded.is_terminal());
        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(!PaymentStatus::Processing.is_terminal());
        assert!(!PaymentStatus::Failed.is_terminal());
    }

    #[test]
    fn test_schema_includes_uuid_fields() {
        let schema = schemars::schema_for!(PurchaseTransaction);
        let json = serde_json::to_value(&schema).unwrap();
        assert!(json["properties"]["id"].is_object());
        assert!(json["properties"]["transaction_id"].is_object());
    }

    #[test]
    fn test_can_complete() {
        let mut tx = PurchaseTransaction {
            id: Uuid::new_v4(),
            transaction_id: Uuid::new_v4(),
            idempotency_key: "key".to_string(),
            user_id: "user-1".to_string(),
            tokens_purchased: 1000,
            amount_paid_cents: 500,
            currency: "USD".to_string(),
            payment_provider: "stripe".to_string(),
            payment_id: None,
            payment_status: PaymentStatus::Processing,
            is_processing: true,
            created_at: Utc::now(),
            completed_at: None,
        };
        assert!(tx.can_complete());

        tx.payment_status = PaymentStatus::Completed;
        tx.is_processing = false;
        assert!(!tx.can_complete());
    }
}
