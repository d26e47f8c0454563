//! Balance Ledger
//!
//! Two-phase reserve / confirm / refund protocol over a user's balance pair.
//!
//! # Balance model
//!
//! ```text
//! available = balance - reserved_balance
//!
//! reserve : reserved += amount                  (hold)
//! confirm : balance  -= amount, reserved -= amount   (hold → deduction)
//! refund  : reserved -= amount                  (release hold)
//!           balance  += amount                  (credit back a confirmed deduction)
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Sole writer**: nothing else mutates `balance` / `reserved_balance`
//! 2. **Serialized per user**: an async mutex per user email plus a
//!    version compare-and-swap on every write (retry on conflict). Order
//!    operations also hold a per-order mutex, taken before the user's.
//! 3. **At most once**: one reservation per order id; confirm and refund
//!    replays are no-ops
//! 4. **Audited**: every attempt, successful or not, appends a balance log entry

pub mod error;
pub mod state;

pub use error::LedgerError;
pub use state::{Reservation, ReservationState};

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::models::{BalanceLogEntry, LogStatus, TransactionType, User, new_id};
use crate::money::validate_amount;
use crate::store::EntityStore;

/// Default number of compare-and-swap attempts per balance write
pub const DEFAULT_MAX_CAS_RETRIES: u32 = 5;

// ============================================================================
// Receipts
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceCheck {
    pub total_balance: Decimal,
    pub reserved_balance: Decimal,
    pub available_balance: Decimal,
    pub can_purchase: bool,
    pub shortage: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveReceipt {
    pub transaction_id: String,
    pub reserved_amount: Decimal,
    pub new_reserved_total: Decimal,
    /// The order already held an identical reservation; nothing changed
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmReceipt {
    pub transaction_id: String,
    pub deducted_amount: Decimal,
    pub new_balance: Decimal,
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub transaction_id: String,
    pub refunded_amount: Decimal,
    pub new_balance: Decimal,
    /// true: a hold was released; false: a confirmed deduction was credited back
    pub released_hold: bool,
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditReceipt {
    pub transaction_id: String,
    pub credited_amount: Decimal,
    pub new_balance: Decimal,
}

/// Kind of admin top-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditKind {
    Deposit,
    Bonus,
}

impl CreditKind {
    fn transaction_type(&self) -> TransactionType {
        match self {
            CreditKind::Deposit => TransactionType::Deposit,
            CreditKind::Bonus => TransactionType::Bonus,
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            CreditKind::Deposit => "DEP",
            CreditKind::Bonus => "BON",
        }
    }
}

/// Identifies what a log entry is about
struct OpContext<'a> {
    tx_type: TransactionType,
    user_email: &'a str,
    amount: Decimal,
    order_id: Option<&'a str>,
    service_name: Option<&'a str>,
    transaction_id: String,
}

// ============================================================================
// Ledger
// ============================================================================

pub struct BalanceLedger {
    store: Arc<dyn EntityStore>,
    user_locks: DashMap<String, Arc<Mutex<()>>>,
    order_locks: DashMap<String, Arc<Mutex<()>>>,
    max_cas_retries: u32,
}

impl BalanceLedger {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self::with_max_retries(store, DEFAULT_MAX_CAS_RETRIES)
    }

    pub fn with_max_retries(store: Arc<dyn EntityStore>, max_cas_retries: u32) -> Self {
        Self {
            store,
            user_locks: DashMap::new(),
            order_locks: DashMap::new(),
            max_cas_retries: max_cas_retries.max(1),
        }
    }

    /// Read-only affordability check
    pub async fn check(&self, user_email: &str, amount: Decimal) -> Result<BalanceCheck, LedgerError> {
        let amount = validate_amount(amount)?;
        let user = self.load_user(user_email).await?;
        let available = user.available_balance();

        Ok(BalanceCheck {
            total_balance: user.balance,
            reserved_balance: user.reserved_balance,
            available_balance: available,
            can_purchase: available >= amount,
            shortage: (amount - available).max(Decimal::ZERO),
        })
    }

    /// Place a hold for `order_id`. Availability is re-checked under the user lock.
    pub async fn reserve(
        &self,
        user_email: &str,
        amount: Decimal,
        order_id: &str,
        service_name: &str,
    ) -> Result<ReserveReceipt, LedgerError> {
        let ctx = OpContext {
            tx_type: TransactionType::Reserve,
            user_email,
            amount,
            order_id: Some(order_id),
            service_name: Some(service_name),
            transaction_id: format!("RES-{}-{}", order_id, Utc::now().timestamp_millis()),
        };

        let result = self.reserve_locked(&ctx).await;
        if let Err(e) = &result {
            self.record_failure(&ctx, e).await;
        }
        result
    }

    /// Turn the hold identified by `transaction_id` into a permanent deduction.
    ///
    /// Only call after the guarded external action definitively succeeded.
    pub async fn confirm(
        &self,
        user_email: &str,
        amount: Decimal,
        order_id: &str,
        service_name: &str,
        transaction_id: &str,
    ) -> Result<ConfirmReceipt, LedgerError> {
        let ctx = OpContext {
            tx_type: TransactionType::Confirm,
            user_email,
            amount,
            order_id: Some(order_id),
            service_name: Some(service_name),
            transaction_id: transaction_id.to_string(),
        };

        let result = self.confirm_locked(&ctx).await;
        if let Err(e) = &result {
            self.record_failure(&ctx, e).await;
        }
        result
    }

    /// Return the order's money to the user: release the hold, or credit back
    /// a deduction that was already confirmed.
    pub async fn refund(
        &self,
        user_email: &str,
        amount: Decimal,
        order_id: &str,
        service_name: &str,
        reason: &str,
    ) -> Result<RefundReceipt, LedgerError> {
        let ctx = OpContext {
            tx_type: TransactionType::Refund,
            user_email,
            amount,
            order_id: Some(order_id),
            service_name: Some(service_name),
            transaction_id: format!("REF-{}-{}", order_id, Utc::now().timestamp_millis()),
        };

        let result = self.refund_locked(&ctx, reason).await;
        if let Err(e) = &result {
            self.record_failure(&ctx, e).await;
        }
        result
    }

    /// Admin top-up (deposit or bonus)
    pub async fn credit(
        &self,
        user_email: &str,
        amount: Decimal,
        kind: CreditKind,
        notes: &str,
    ) -> Result<CreditReceipt, LedgerError> {
        let ctx = OpContext {
            tx_type: kind.transaction_type(),
            user_email,
            amount,
            order_id: None,
            service_name: None,
            transaction_id: format!("{}-{}", kind.prefix(), ulid::Ulid::new()),
        };

        let result = self.credit_locked(&ctx, notes).await;
        if let Err(e) = &result {
            self.record_failure(&ctx, e).await;
        }
        result
    }

    // ========================================================================
    // Operation bodies (run under the per-order and per-user locks)
    // ========================================================================

    async fn reserve_locked(&self, ctx: &OpContext<'_>) -> Result<ReserveReceipt, LedgerError> {
        let amount = validate_amount(ctx.amount)?;
        let order_id = ctx.order_id.unwrap_or_default();
        let _order_guard = Self::lock(&self.order_locks, order_id).await;
        let _guard = self.lock_user(ctx.user_email).await;

        if let Some(existing) = self.store.get_reservation(order_id).await? {
            let identical = existing.state.is_holding()
                && existing.belongs_to(ctx.user_email)
                && existing.amount == amount;
            if !identical {
                return Err(LedgerError::DuplicateReservation(order_id.to_string()));
            }

            let user = self.load_user(ctx.user_email).await?;
            debug!(order_id, transaction_id = %existing.transaction_id, "Reserve replayed");
            return Ok(ReserveReceipt {
                transaction_id: existing.transaction_id,
                reserved_amount: amount,
                new_reserved_total: user.reserved_balance,
                replayed: true,
            });
        }

        let (before, after) = self
            .apply_balance_change(ctx.user_email, |user| {
                let available = user.available_balance();
                if available < amount {
                    return Err(LedgerError::InsufficientBalance {
                        available,
                        required: amount,
                    });
                }
                Ok((user.balance, user.reserved_balance + amount))
            })
            .await?;

        let reservation = Reservation::new(order_id, &ctx.transaction_id, ctx.user_email, amount);
        self.persist_reservation(&reservation, &before, &after).await?;

        self.record_success(
            ctx,
            &before,
            &after,
            format!("Reserved {amount} for order {order_id}"),
        )
        .await;

        info!(
            user = ctx.user_email,
            order_id,
            transaction_id = %ctx.transaction_id,
            amount = %amount,
            "Funds reserved"
        );

        Ok(ReserveReceipt {
            transaction_id: ctx.transaction_id.clone(),
            reserved_amount: amount,
            new_reserved_total: after.reserved_balance,
            replayed: false,
        })
    }

    async fn confirm_locked(&self, ctx: &OpContext<'_>) -> Result<ConfirmReceipt, LedgerError> {
        let amount = validate_amount(ctx.amount)?;
        let order_id = ctx.order_id.unwrap_or_default();
        let _order_guard = Self::lock(&self.order_locks, order_id).await;
        let _guard = self.lock_user(ctx.user_email).await;

        let mut reservation = self.matching_reservation(ctx, amount).await?;
        if reservation.transaction_id != ctx.transaction_id {
            return Err(LedgerError::TransactionMismatch {
                order_id: order_id.to_string(),
                expected: reservation.transaction_id,
                provided: ctx.transaction_id.clone(),
            });
        }

        if reservation.state == ReservationState::Confirmed {
            let user = self.load_user(ctx.user_email).await?;
            debug!(order_id, transaction_id = %ctx.transaction_id, "Confirm replayed");
            return Ok(ConfirmReceipt {
                transaction_id: reservation.transaction_id,
                deducted_amount: amount,
                new_balance: user.balance,
                replayed: true,
            });
        }
        if !reservation.state.can_transition_to(ReservationState::Confirmed) {
            return Err(LedgerError::InvalidTransition {
                order_id: order_id.to_string(),
                from: reservation.state,
                to: ReservationState::Confirmed,
            });
        }

        let (before, after) = self
            .apply_balance_change(ctx.user_email, |user| {
                Ok((
                    user.balance - amount,
                    (user.reserved_balance - amount).max(Decimal::ZERO),
                ))
            })
            .await?;

        reservation.state = ReservationState::Confirmed;
        reservation.updated_at = Utc::now();
        self.persist_reservation(&reservation, &before, &after).await?;

        self.record_success(
            ctx,
            &before,
            &after,
            format!("Confirmed reservation {}", reservation.transaction_id),
        )
        .await;

        info!(
            user = ctx.user_email,
            order_id,
            transaction_id = %ctx.transaction_id,
            amount = %amount,
            new_balance = %after.balance,
            "Reservation confirmed"
        );

        Ok(ConfirmReceipt {
            transaction_id: reservation.transaction_id,
            deducted_amount: amount,
            new_balance: after.balance,
            replayed: false,
        })
    }

    async fn refund_locked(
        &self,
        ctx: &OpContext<'_>,
        reason: &str,
    ) -> Result<RefundReceipt, LedgerError> {
        let amount = validate_amount(ctx.amount)?;
        let order_id = ctx.order_id.unwrap_or_default();
        let _order_guard = Self::lock(&self.order_locks, order_id).await;
        let _guard = self.lock_user(ctx.user_email).await;

        let mut reservation = self.matching_reservation(ctx, amount).await?;

        if reservation.state.is_terminal() {
            let user = self.load_user(ctx.user_email).await?;
            debug!(order_id, "Refund replayed");
            return Ok(RefundReceipt {
                transaction_id: reservation
                    .refund_transaction_id
                    .unwrap_or_else(|| ctx.transaction_id.clone()),
                refunded_amount: amount,
                new_balance: user.balance,
                released_hold: false,
                replayed: true,
            });
        }
        if !reservation.state.can_transition_to(ReservationState::Refunded) {
            return Err(LedgerError::InvalidTransition {
                order_id: order_id.to_string(),
                from: reservation.state,
                to: ReservationState::Refunded,
            });
        }
        let released_hold = reservation.state.is_holding();

        let (before, after) = self
            .apply_balance_change(ctx.user_email, |user| {
                if released_hold {
                    Ok((
                        user.balance,
                        (user.reserved_balance - amount).max(Decimal::ZERO),
                    ))
                } else {
                    Ok((user.balance + amount, user.reserved_balance))
                }
            })
            .await?;

        reservation.state = ReservationState::Refunded;
        reservation.refund_transaction_id = Some(ctx.transaction_id.clone());
        reservation.updated_at = Utc::now();
        self.persist_reservation(&reservation, &before, &after).await?;

        self.record_success(ctx, &before, &after, reason.to_string())
            .await;

        info!(
            user = ctx.user_email,
            order_id,
            transaction_id = %ctx.transaction_id,
            amount = %amount,
            released_hold,
            reason,
            "Refund applied"
        );

        Ok(RefundReceipt {
            transaction_id: ctx.transaction_id.clone(),
            refunded_amount: amount,
            new_balance: after.balance,
            released_hold,
            replayed: false,
        })
    }

    async fn credit_locked(
        &self,
        ctx: &OpContext<'_>,
        notes: &str,
    ) -> Result<CreditReceipt, LedgerError> {
        let amount = validate_amount(ctx.amount)?;
        let _guard = self.lock_user(ctx.user_email).await;

        let (before, after) = self
            .apply_balance_change(ctx.user_email, |user| {
                Ok((user.balance + amount, user.reserved_balance))
            })
            .await?;

        self.record_success(ctx, &before, &after, notes.to_string())
            .await;

        info!(
            user = ctx.user_email,
            kind = %ctx.tx_type,
            amount = %amount,
            "Balance credited"
        );

        Ok(CreditReceipt {
            transaction_id: ctx.transaction_id.clone(),
            credited_amount: amount,
            new_balance: after.balance,
        })
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn lock_user(&self, user_email: &str) -> OwnedMutexGuard<()> {
        Self::lock(&self.user_locks, &user_email.to_lowercase()).await
    }

    async fn lock(locks: &DashMap<String, Arc<Mutex<()>>>, key: &str) -> OwnedMutexGuard<()> {
        let lock = locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    async fn load_user(&self, user_email: &str) -> Result<User, LedgerError> {
        self.store
            .find_user(user_email)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(user_email.to_string()))
    }

    /// Fetch the order's reservation and check it belongs to this call
    async fn matching_reservation(
        &self,
        ctx: &OpContext<'_>,
        amount: Decimal,
    ) -> Result<Reservation, LedgerError> {
        let order_id = ctx.order_id.unwrap_or_default();
        let reservation = self
            .store
            .get_reservation(order_id)
            .await?
            .ok_or_else(|| LedgerError::ReservationNotFound(order_id.to_string()))?;

        if !reservation.belongs_to(ctx.user_email) {
            return Err(LedgerError::ReservationMismatch {
                order_id: order_id.to_string(),
                reason: format!("reservation belongs to {}", reservation.user_email),
            });
        }
        if reservation.amount != amount {
            return Err(LedgerError::ReservationMismatch {
                order_id: order_id.to_string(),
                reason: format!("reserved {}, requested {}", reservation.amount, amount),
            });
        }
        Ok(reservation)
    }

    /// Read-compute-CAS loop. `compute` returns the new `(balance, reserved)`.
    async fn apply_balance_change<F>(
        &self,
        user_email: &str,
        compute: F,
    ) -> Result<(User, User), LedgerError>
    where
        F: Fn(&User) -> Result<(Decimal, Decimal), LedgerError>,
    {
        for attempt in 1..=self.max_cas_retries {
            let current = self.load_user(user_email).await?;
            let (balance, reserved) = compute(&current)?;

            if let Some(updated) = self
                .store
                .compare_and_swap_balance(user_email, current.version, balance, reserved)
                .await?
            {
                return Ok((current, updated));
            }

            warn!(
                user = user_email,
                attempt,
                version = current.version,
                "Balance version conflict, retrying"
            );
            tokio::task::yield_now().await;
        }

        error!(user = user_email, "Balance update gave up after repeated conflicts");
        Err(LedgerError::Contention(user_email.to_string()))
    }

    /// Save the reservation; if that fails, undo the balance write that preceded it.
    async fn persist_reservation(
        &self,
        reservation: &Reservation,
        before: &User,
        after: &User,
    ) -> Result<(), LedgerError> {
        let Err(e) = self.store.save_reservation(reservation).await else {
            return Ok(());
        };

        error!(
            order_id = %reservation.order_id,
            error = %e,
            "Failed to persist reservation, reverting balance change"
        );

        let delta_balance = after.balance - before.balance;
        let delta_reserved = after.reserved_balance - before.reserved_balance;
        if let Err(revert_err) = self
            .apply_balance_change(&before.email, |user| {
                Ok((
                    user.balance - delta_balance,
                    user.reserved_balance - delta_reserved,
                ))
            })
            .await
        {
            error!(
                order_id = %reservation.order_id,
                error = %revert_err,
                "CRITICAL: balance revert failed, manual reconciliation required"
            );
        }

        Err(e.into())
    }

    async fn record_success(&self, ctx: &OpContext<'_>, before: &User, after: &User, notes: String) {
        let entry = self.log_entry(
            ctx,
            before.available_balance(),
            after.available_balance(),
            LogStatus::Completed,
            notes,
        );
        if let Err(e) = self.store.append_balance_log(&entry).await {
            // The balance write already happened; surface loudly but do not undo it
            error!(
                transaction_id = %entry.transaction_id,
                error = %e,
                "Failed to append balance log entry"
            );
        }
    }

    async fn record_failure(&self, ctx: &OpContext<'_>, failure: &LedgerError) {
        let available = match self.store.find_user(ctx.user_email).await {
            Ok(Some(user)) => user.available_balance(),
            _ => Decimal::ZERO,
        };

        warn!(
            user = ctx.user_email,
            kind = %ctx.tx_type,
            order_id = ctx.order_id.unwrap_or_default(),
            error = %failure,
            "Ledger operation failed"
        );

        let entry = self.log_entry(ctx, available, available, LogStatus::Failed, failure.to_string());
        if let Err(e) = self.store.append_balance_log(&entry).await {
            error!(
                transaction_id = %entry.transaction_id,
                error = %e,
                "Failed to append balance log entry for failed operation"
            );
        }
    }

    fn log_entry(
        &self,
        ctx: &OpContext<'_>,
        previous_balance: Decimal,
        new_balance: Decimal,
        status: LogStatus,
        notes: String,
    ) -> BalanceLogEntry {
        BalanceLogEntry {
            id: new_id(),
            user_email: ctx.user_email.to_string(),
            transaction_type: ctx.tx_type,
            amount: ctx.amount,
            previous_balance,
            new_balance,
            order_id: ctx.order_id.map(str::to_string),
            service_name: ctx.service_name.map(str::to_string),
            status,
            transaction_id: ctx.transaction_id.clone(),
            notes,
            created_at: Utc::now(),
        }
    }
}
