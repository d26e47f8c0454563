//! Reconciliation Worker
//!
//! Retries compensating refunds that failed inside the submission saga.
//! Each open task is retried through the ledger; ledger idempotency makes a
//! retry of an already-applied refund a no-op. Tasks whose refund can never
//! succeed (no reservation, mismatched reservation) are parked for an
//! operator instead of being retried forever.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::ledger::{BalanceLedger, LedgerError};
use crate::models::{ReconciliationStatus, ReconciliationTask};
use crate::store::{EntityStore, StoreError};

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub scan_interval: Duration,
    pub batch_size: usize,
    /// Attempts after which every further failure is logged as critical
    pub alert_after_attempts: u32,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            batch_size: 100,
            alert_after_attempts: 5,
        }
    }
}

pub struct ReconciliationWorker {
    store: Arc<dyn EntityStore>,
    ledger: Arc<BalanceLedger>,
    config: ReconciliationConfig,
}

impl ReconciliationWorker {
    pub fn new(
        store: Arc<dyn EntityStore>,
        ledger: Arc<BalanceLedger>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            config,
        }
    }

    pub async fn run(&self) {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            "Starting reconciliation worker"
        );

        loop {
            if let Err(e) = self.sweep().await {
                error!(error = %e, "Reconciliation sweep failed");
            }
            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    /// One pass over open tasks. Returns how many were resolved.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let tasks = self
            .store
            .list_open_reconciliations(self.config.batch_size)
            .await?;

        if tasks.is_empty() {
            debug!("No open reconciliation tasks");
            return Ok(0);
        }

        info!(count = tasks.len(), "Retrying failed refunds");

        let mut resolved = 0;
        for task in tasks {
            let id = task.id.clone();
            match self.retry(task).await {
                Ok(true) => resolved += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(task_id = %id, error = %e, "Failed to record reconciliation attempt");
                }
            }
        }

        if resolved > 0 {
            info!(count = resolved, "Reconciliation tasks resolved");
        }
        Ok(resolved)
    }

    async fn retry(&self, mut task: ReconciliationTask) -> Result<bool, StoreError> {
        let result = self
            .ledger
            .refund(
                &task.user_email,
                task.amount,
                &task.order_id,
                &task.service_name,
                &task.reason,
            )
            .await;

        task.attempts += 1;
        task.updated_at = Utc::now();

        let resolved = match result {
            Ok(receipt) => {
                info!(
                    order_id = %task.order_id,
                    transaction_id = %receipt.transaction_id,
                    attempts = task.attempts,
                    "Refund reconciled"
                );
                task.status = ReconciliationStatus::Resolved;
                task.last_error = None;
                true
            }
            Err(e) if !e.is_transient() => {
                self.park(&mut task, &e);
                false
            }
            Err(e) => {
                if task.attempts > self.config.alert_after_attempts {
                    error!(
                        order_id = %task.order_id,
                        user = %task.user_email,
                        amount = %task.amount,
                        attempts = task.attempts,
                        error = %e,
                        "CRITICAL: refund still failing, manual intervention required"
                    );
                } else {
                    warn!(
                        order_id = %task.order_id,
                        attempts = task.attempts,
                        error = %e,
                        "Refund retry failed"
                    );
                }
                task.last_error = Some(e.to_string());
                false
            }
        };

        self.store.update_reconciliation(&task).await?;
        Ok(resolved)
    }

    fn park(&self, task: &mut ReconciliationTask, failure: &LedgerError) {
        error!(
            order_id = %task.order_id,
            user = %task.user_email,
            amount = %task.amount,
            error = %failure,
            code = failure.code(),
            "CRITICAL: refund cannot be applied automatically, task parked"
        );
        task.status = ReconciliationStatus::Parked;
        task.last_error = Some(failure.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use crate::store::MemoryStore;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    const EMAIL: &str = "buyer@example.com";

    fn task(order_id: &str) -> ReconciliationTask {
        let now = Utc::now();
        ReconciliationTask {
            id: format!("rec-{order_id}"),
            order_id: order_id.into(),
            user_email: EMAIL.into(),
            amount: dec!(10),
            service_name: "Unlock".into(),
            reason: "provider rejected".into(),
            status: ReconciliationStatus::Open,
            attempts: 0,
            last_error: Some("store down".into()),
            created_at: now,
            updated_at: now,
        }
    }

    async fn setup() -> (Arc<MemoryStore>, Arc<BalanceLedger>, ReconciliationWorker) {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(User::new(EMAIL, dec!(50)));
        let ledger = Arc::new(BalanceLedger::new(store.clone()));
        ledger.reserve(EMAIL, dec!(10), "o1", "Unlock").await.unwrap();
        store.create_reconciliation(&task("o1")).await.unwrap();

        let worker = ReconciliationWorker::new(
            store.clone(),
            ledger.clone(),
            ReconciliationConfig {
                alert_after_attempts: 1,
                ..ReconciliationConfig::default()
            },
        );
        (store, ledger, worker)
    }

    #[test]
    fn test_config_default() {
        let config = ReconciliationConfig::default();
        assert_eq!(config.scan_interval, Duration::from_secs(30));
        assert_eq!(config.batch_size, 100);
    }

    #[tokio::test]
    async fn test_sweep_resolves_pending_refund() {
        let (store, _ledger, worker) = setup().await;

        assert_eq!(worker.sweep().await.unwrap(), 1);

        let user = store.user(EMAIL).unwrap();
        assert_eq!(user.balance, dec!(50));
        assert_eq!(user.reserved_balance, Decimal::ZERO);

        let tasks = store.reconciliations();
        assert_eq!(tasks[0].status, ReconciliationStatus::Resolved);
        assert_eq!(tasks[0].attempts, 1);
        assert_eq!(tasks[0].last_error, None);

        // Nothing left to do
        assert_eq!(worker.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_already_refunded_resolves_without_double_credit() {
        let (store, ledger, worker) = setup().await;
        ledger
            .refund(EMAIL, dec!(10), "o1", "Unlock", "manual")
            .await
            .unwrap();

        assert_eq!(worker.sweep().await.unwrap(), 1);
        assert_eq!(store.user(EMAIL).unwrap().balance, dec!(50));
    }

    #[tokio::test]
    async fn test_refund_that_cannot_apply_is_parked() {
        let (store, _ledger, worker) = setup().await;
        // No reservation was ever made for this order
        store.create_reconciliation(&task("o-missing")).await.unwrap();

        assert_eq!(worker.sweep().await.unwrap(), 1);

        let parked = store
            .reconciliations()
            .into_iter()
            .find(|t| t.order_id == "o-missing")
            .unwrap();
        assert_eq!(parked.status, ReconciliationStatus::Parked);
        assert!(parked.last_error.unwrap().contains("No reservation found"));

        // Parked tasks are not picked up again
        assert_eq!(worker.sweep().await.unwrap(), 0);
        assert!(store.reconciliations().iter().all(|t| t.attempts == 1));
    }

    #[tokio::test]
    async fn test_bookkeeping_failure_does_not_abort_sweep() {
        let (store, _ledger, worker) = setup().await;
        store.inject_failure("update_reconciliation");

        // The refund itself goes through; only the task write fails
        assert_eq!(worker.sweep().await.unwrap(), 0);
        assert_eq!(store.user(EMAIL).unwrap().reserved_balance, Decimal::ZERO);

        store.clear_failure("update_reconciliation");
        assert_eq!(worker.sweep().await.unwrap(), 1);
        assert_eq!(store.user(EMAIL).unwrap().balance, dec!(50));
        assert_eq!(
            store.reconciliations()[0].status,
            ReconciliationStatus::Resolved
        );
    }

    #[tokio::test]
    async fn test_failed_retry_keeps_task_open() {
        let (store, _ledger, worker) = setup().await;
        store.inject_failure("get_reservation");

        assert_eq!(worker.sweep().await.unwrap(), 0);
        assert_eq!(worker.sweep().await.unwrap(), 0);

        let tasks = store.reconciliations();
        assert_eq!(tasks[0].status, ReconciliationStatus::Open);
        assert_eq!(tasks[0].attempts, 2);
        assert!(tasks[0].last_error.as_ref().unwrap().contains("injected failure"));

        store.clear_failure("get_reservation");
        assert_eq!(worker.sweep().await.unwrap(), 1);
        assert_eq!(store.user(EMAIL).unwrap().reserved_balance, Decimal::ZERO);
    }
}
