//! HTTP handlers
//!
//! Success bodies are the domain receipts serialized as-is; failures go
//! through [`ApiError`].

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    response::{IntoResponse, Response},
};
use tracing::info;

use super::auth::Claims;
use super::state::AppState;
use super::types::{ApiError, BalanceAction, BalanceRequest, HealthResponse};
use crate::admin::{StatusUpdate, StatusUpdateOutcome};
use crate::ledger::CreditKind;
use crate::poller::PollSummary;
use crate::submission::{SubmissionError, SubmissionReceipt};

/// GET /api/v1/health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: env!("GIT_HASH").to_string(),
    })
}

/// POST /api/v1/admin/balance
///
/// Manual ledger control. `reserve`, `confirm` and `refund` need `order_id`;
/// `confirm` also needs the `transaction_id` returned by `reserve`.
pub async fn balance_action(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<BalanceRequest>,
) -> Result<Response, ApiError> {
    let amount = req.amount()?;
    info!(
        admin = %claims.sub,
        action = ?req.action,
        user = %req.user_email,
        amount = %amount,
        "Admin balance action"
    );

    let ledger = &state.ledger;
    let email = req.user_email.as_str();
    let response = match req.action {
        BalanceAction::Check => Json(ledger.check(email, amount).await?).into_response(),
        BalanceAction::Reserve => Json(
            ledger
                .reserve(email, amount, req.order_id()?, req.service_name())
                .await?,
        )
        .into_response(),
        BalanceAction::Confirm => Json(
            ledger
                .confirm(
                    email,
                    amount,
                    req.order_id()?,
                    req.service_name(),
                    req.transaction_id()?,
                )
                .await?,
        )
        .into_response(),
        BalanceAction::Refund => {
            let reason = req.reason.as_deref().unwrap_or("Manual refund");
            Json(
                ledger
                    .refund(email, amount, req.order_id()?, req.service_name(), reason)
                    .await?,
            )
            .into_response()
        }
        BalanceAction::Deposit | BalanceAction::Bonus => {
            let kind = if req.action == BalanceAction::Deposit {
                CreditKind::Deposit
            } else {
                CreditKind::Bonus
            };
            let notes = req.reason.as_deref().unwrap_or("");
            Json(ledger.credit(email, amount, kind, notes).await?).into_response()
        }
    };
    Ok(response)
}

/// POST /api/v1/orders/{id}/submit
///
/// Allowed for the order's owner and for admins.
pub async fn submit_order(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(order_id): Path<String>,
) -> Result<Json<SubmissionReceipt>, ApiError> {
    let order = state
        .store
        .get_order(&order_id)
        .await?
        .ok_or_else(|| SubmissionError::OrderNotFound(order_id.clone()))?;

    if !claims.is_admin() && !claims.is_user(&order.created_by) {
        return Err(ApiError::forbidden("Not the owner of this order"));
    }

    let receipt = state.submitter.submit_order_to_provider(&order_id).await?;
    Ok(Json(receipt))
}

/// PATCH /api/v1/admin/orders/{id}
pub async fn update_order_status(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(order_id): Path<String>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<StatusUpdateOutcome>, ApiError> {
    info!(admin = %claims.sub, order_id = %order_id, status = %update.status, "Admin status update");
    let outcome = state.admin.update_status(&order_id, update).await?;
    Ok(Json(outcome))
}

/// POST /api/v1/admin/poll
pub async fn trigger_poll(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PollSummary>, ApiError> {
    let summary = state.poller.poll_once().await?;
    Ok(Json(summary))
}
