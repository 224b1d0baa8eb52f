//! Business logic services.

pub mod purchase;
pub mod quota;
pub mod stale_purchase_sweeper;

pub use purchase::PurchaseService;
pub use quota::{GateDecision, QuotaService};
pub use stale_purchase_sweeper::StalePurchaseSweeper;
