//! Order Submission Orchestrator
//!
//! Single-shot saga forwarding a local order to its upstream provider.
//!
//! ```text
//! load → check → claim → RESERVE ─┬─ gate → map → submit ─┬─ ok  → ExternalOrder → CONFIRM → processing
//!                                 │                        └─ err → REFUND → order failed
//!                                 └─ any unexpected error ────────→ REFUND (→ reconciliation task if that fails)
//! ```
//!
//! The claim moves the order pending → processing with a conditional write,
//! so concurrent submissions of one order reach the provider at most once.
//!
//! # Guarantees
//!
//! - every invocation that reserved ends in exactly one of confirm / refund
//! - nothing after a successful confirm triggers a refund
//! - a replayed reservation belongs to another invocation and is left alone
//! - the provider call is never retried here

pub mod error;


pub use error::SubmissionError;

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::ledger::BalanceLedger;
use crate::models::{
    ApiLogEntry, ApiProvider, ExternalOrder, ExternalOrderStatus, Order, OrderStatus,
    ReconciliationStatus, ReconciliationTask, Service, new_id,
};
use crate::provider::{MapperRegistry, SubmissionAdapter, SubmissionOutcome};
use crate::store::EntityStore;

const AUTO_SUBMIT_DISABLED: &str = "auto-submit disabled";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub order_id: String,
    pub external_order_id: String,
    pub provider_status: String,
    pub transaction_id: String,
    pub charged_amount: Decimal,
    pub new_balance: Decimal,
}

/// Everything the post-reservation steps work on
struct Saga {
    order: Order,
    service: Service,
    provider: ApiProvider,
    transaction_id: String,
    /// An API log entry has been written for this invocation
    provider_logged: bool,
}

/// Why the saga stopped before confirm
enum Abort {
    /// Expected outcome (feature gate, provider rejection): refund with `reason`
    Rejected {
        error: SubmissionError,
        reason: String,
    },
    /// Anything else after the reservation
    Fault(SubmissionError),
}

pub struct OrderSubmitter {
    store: Arc<dyn EntityStore>,
    ledger: Arc<BalanceLedger>,
    mappers: Arc<MapperRegistry>,
    adapter: Arc<SubmissionAdapter>,
}

impl OrderSubmitter {
    pub fn new(
        store: Arc<dyn EntityStore>,
        ledger: Arc<BalanceLedger>,
        mappers: Arc<MapperRegistry>,
        adapter: Arc<SubmissionAdapter>,
    ) -> Self {
        Self {
            store,
            ledger,
            mappers,
            adapter,
        }
    }

    /// Forward a pending order to its provider, charging the customer only if
    /// the provider accepts it.
    pub async fn submit_order_to_provider(
        &self,
        order_id: &str,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        let (order, service, provider) = self.load(order_id).await?;

        let check = self.ledger.check(&order.created_by, order.amount).await?;
        if !check.can_purchase {
            info!(
                order_id,
                available = %check.available_balance,
                required = %order.amount,
                "Order rejected: insufficient balance"
            );
            return Err(SubmissionError::InsufficientFunds {
                available: check.available_balance,
                required: order.amount,
            });
        }

        let Some(order) = self
            .store
            .transition_order_status(&order.id, OrderStatus::Pending, OrderStatus::Processing)
            .await?
        else {
            info!(order_id, "Order already claimed by another submission");
            return Err(SubmissionError::AlreadyInFlight(order_id.to_string()));
        };

        let reservation = match self
            .ledger
            .reserve(&order.created_by, order.amount, &order.id, &service.name)
            .await
        {
            Ok(r) if r.replayed => {
                warn!(
                    order_id,
                    transaction_id = %r.transaction_id,
                    "Order already holds a reservation, not forwarding"
                );
                self.release_claim(order_id).await;
                return Err(SubmissionError::AlreadyInFlight(order_id.to_string()));
            }
            Ok(r) => r,
            Err(e) => {
                self.release_claim(order_id).await;
                return Err(e.into());
            }
        };

        info!(
            order_id,
            transaction_id = %reservation.transaction_id,
            provider = %provider.name,
            "Funds reserved, forwarding order"
        );

        let mut saga = Saga {
            order,
            service,
            provider,
            transaction_id: reservation.transaction_id,
            provider_logged: false,
        };

        match self.forward(&mut saga).await {
            Ok(receipt) => Ok(receipt),
            Err(abort) => Err(self.compensate(&mut saga, abort).await),
        }
    }

    async fn load(&self, order_id: &str) -> Result<(Order, Service, ApiProvider), SubmissionError> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| SubmissionError::OrderNotFound(order_id.to_string()))?;

        if order.status != OrderStatus::Pending {
            return Err(SubmissionError::InvalidOrderState {
                order_id: order.id,
                status: order.status,
            });
        }

        let service = self
            .store
            .get_service(&order.service_id)
            .await?
            .ok_or_else(|| SubmissionError::ServiceNotFound(order.service_id.clone()))?;

        let provider = self
            .store
            .get_provider(&service.provider_id)
            .await?
            .ok_or_else(|| SubmissionError::ProviderNotFound(service.provider_id.clone()))?;

        Ok((order, service, provider))
    }

    /// Hand a claimed order back to pending when nothing was reserved for it
    async fn release_claim(&self, order_id: &str) {
        match self
            .store
            .transition_order_status(order_id, OrderStatus::Processing, OrderStatus::Pending)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => warn!(order_id, "Order moved on before its claim was released"),
            Err(e) => error!(order_id, error = %e, "Failed to release order claim"),
        }
    }

    /// Steps between reserve and confirm. Any `Err` here is compensated.
    async fn forward(&self, saga: &mut Saga) -> Result<SubmissionReceipt, Abort> {
        if !saga.provider.is_active || !saga.provider.auto_submit_enabled {
            return Err(Abort::Rejected {
                error: SubmissionError::FeatureDisabled(saga.provider.name.clone()),
                reason: AUTO_SUBMIT_DISABLED.to_string(),
            });
        }

        let mapping = self
            .mappers
            .resolve(&saga.provider)
            .map_err(|e| Abort::Fault(e.into()))?;
        let payload = mapping.mapper.build_payload(&saga.order, &saga.service);

        let outcome = self.adapter.submit(&saga.provider, &mapping, &payload).await;
        self.log_api_call(&saga.order.id, &saga.provider.id, &outcome)
            .await;
        saga.provider_logged = true;

        if !outcome.success {
            let message = outcome
                .error
                .clone()
                .unwrap_or_else(|| "provider rejected the order".to_string());
            warn!(
                order_id = %saga.order.id,
                provider = %saga.provider.name,
                http_status = ?outcome.http_status,
                error = %message,
                "Provider rejected order"
            );
            return Err(Abort::Rejected {
                error: SubmissionError::ProviderRejected {
                    message: message.clone(),
                    http_status: outcome.http_status,
                    diagnosis: outcome.diagnosis.clone(),
                },
                reason: message,
            });
        }

        let external_order_id = outcome.order_id.clone().unwrap_or_default();
        if external_order_id.is_empty() {
            warn!(
                order_id = %saga.order.id,
                provider = %saga.provider.name,
                "Provider accepted order without returning an order id"
            );
        }

        let provider_status = outcome
            .status
            .clone()
            .unwrap_or_else(|| ExternalOrderStatus::Submitted.as_str().to_string());
        let now = Utc::now();
        let external = ExternalOrder {
            id: new_id(),
            local_order_id: saga.order.id.clone(),
            provider_id: saga.provider.id.clone(),
            external_order_id: external_order_id.clone(),
            status: ExternalOrderStatus::Submitted,
            external_status: provider_status.clone(),
            result: None,
            request_payload: outcome.request_payload.clone(),
            response_payload: outcome.response_body.clone(),
            last_check: None,
            created_at: now,
            updated_at: now,
        };
        self.store
            .create_external_order(&external)
            .await
            .map_err(|e| Abort::Fault(e.into()))?;

        let confirm = self
            .ledger
            .confirm(
                &saga.order.created_by,
                saga.order.amount,
                &saga.order.id,
                &saga.service.name,
                &saga.transaction_id,
            )
            .await
            .map_err(|e| Abort::Fault(SubmissionError::Ledger(e)))?;

        // Committed: the provider has the order and the customer is charged
        saga.order.status = OrderStatus::Processing;
        if let Err(e) = self.store.update_order(&saga.order).await {
            error!(
                order_id = %saga.order.id,
                error = %e,
                "Order charged and submitted but status update failed"
            );
        }

        info!(
            order_id = %saga.order.id,
            external_order_id = %external_order_id,
            transaction_id = %saga.transaction_id,
            new_balance = %confirm.new_balance,
            "Order submitted to provider"
        );

        Ok(SubmissionReceipt {
            order_id: saga.order.id.clone(),
            external_order_id,
            provider_status,
            transaction_id: saga.transaction_id.clone(),
            charged_amount: confirm.deducted_amount,
            new_balance: confirm.new_balance,
        })
    }

    /// Refund the reservation, fail the order and hand back the error to surface
    async fn compensate(&self, saga: &mut Saga, abort: Abort) -> SubmissionError {
        let (error, reason, fault) = match abort {
            Abort::Rejected { error, reason } => (error, reason, false),
            Abort::Fault(error) => {
                let reason = error.to_string();
                (error, reason, true)
            }
        };

        if fault {
            error!(
                order_id = %saga.order.id,
                error = %error,
                "Unexpected error after reservation, compensating"
            );
            if !saga.provider_logged {
                self.log_aborted_submission(saga, &reason).await;
            }
        }

        self.refund_or_escalate(saga, &reason).await;

        let note = match &error {
            SubmissionError::FeatureDisabled(_) => {
                format!("Auto-submit disabled for provider {}", saga.provider.name)
            }
            SubmissionError::ProviderRejected { message, .. } => {
                format!("Provider submission failed: {message}")
            }
            other => format!("Submission aborted: {other}"),
        };
        saga.order.status = OrderStatus::Failed;
        saga.order.admin_notes = Some(note);
        if let Err(e) = self.store.update_order(&saga.order).await {
            error!(order_id = %saga.order.id, error = %e, "Failed to mark order failed");
        }

        error
    }

    /// Compensating refund. A failure leaves a durable reconciliation task.
    async fn refund_or_escalate(&self, saga: &Saga, reason: &str) {
        let order = &saga.order;
        let result = self
            .ledger
            .refund(
                &order.created_by,
                order.amount,
                &order.id,
                &saga.service.name,
                reason,
            )
            .await;

        let refund_error = match result {
            Ok(receipt) => {
                info!(
                    order_id = %order.id,
                    transaction_id = %receipt.transaction_id,
                    reason,
                    "Reservation refunded"
                );
                return;
            }
            Err(e) => e,
        };

        error!(
            order_id = %order.id,
            user = %order.created_by,
            amount = %order.amount,
            error = %refund_error,
            "Compensating refund failed, queueing reconciliation"
        );

        let now = Utc::now();
        let task = ReconciliationTask {
            id: new_id(),
            order_id: order.id.clone(),
            user_email: order.created_by.clone(),
            amount: order.amount,
            service_name: saga.service.name.clone(),
            reason: reason.to_string(),
            status: ReconciliationStatus::Open,
            attempts: 0,
            last_error: Some(refund_error.to_string()),
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.store.create_reconciliation(&task).await {
            error!(
                order_id = %order.id,
                user = %order.created_by,
                amount = %order.amount,
                error = %e,
                "CRITICAL: refund failed and reconciliation task could not be stored"
            );
        }
    }

    async fn log_api_call(&self, order_id: &str, provider_id: &str, outcome: &SubmissionOutcome) {
        let entry = ApiLogEntry {
            id: new_id(),
            provider_id: provider_id.to_string(),
            order_id: order_id.to_string(),
            endpoint: outcome.endpoint.clone(),
            request_payload: outcome.request_payload.clone(),
            response_payload: outcome.response_body.clone(),
            http_status: outcome.http_status,
            success: outcome.success,
            error_message: outcome.error.clone(),
            error_diagnosis: outcome.diagnosis.clone(),
            detailed_log: outcome.detailed_log.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.append_api_log(&entry).await {
            error!(order_id, error = %e, "Failed to append API log entry");
        }
    }

    /// API log entry for a submission that never reached the provider
    async fn log_aborted_submission(&self, saga: &Saga, reason: &str) {
        let entry = ApiLogEntry {
            id: new_id(),
            provider_id: saga.provider.id.clone(),
            order_id: saga.order.id.clone(),
            endpoint: saga.provider.base_url.clone(),
            request_payload: String::new(),
            response_payload: String::new(),
            http_status: None,
            success: false,
            error_message: Some(reason.to_string()),
            error_diagnosis: None,
            detailed_log: format!("Submission aborted before provider call: {reason}"),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.append_api_log(&entry).await {
            error!(order_id = %saga.order.id, error = %e, "Failed to append API log entry");
        }
    }
}
