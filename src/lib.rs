//! Reseller Ledger - balance reservations and upstream order submission
//!
//! # Modules
//!
//! - [`money`] - Decimal validation and rounding
//! - [`models`] - Users, orders, services, providers and log records
//! - [`store`] - Persistence seam and in-memory store
//! - [`ledger`] - Reserve / confirm / refund against user balances
//! - [`provider`] - Field mappers, wire codecs and the submission adapter
//! - [`submission`] - Order submission saga
//! - [`poller`] - Background status polling of external orders
//! - [`reconciliation`] - Retries of failed compensating refunds
//! - [`admin`] - Admin order status changes
//! - [`notify`] - Outbound email seam
//! - [`gateway`] - Admin HTTP surface

pub mod money;
pub mod models;
pub mod store;

pub mod ledger;
pub mod provider;
pub mod submission;

// Background workers
pub mod poller;
pub mod reconciliation;

pub mod admin;
pub mod notify;

pub mod config;
pub mod gateway;
pub mod logging;

pub use ledger::{BalanceLedger, LedgerError};
pub use store::{EntityStore, MemoryStore, StoreError};
pub use submission::{OrderSubmitter, SubmissionError, SubmissionReceipt};
