use std::sync::Arc;

use super::auth::JwtAuth;
use crate::admin::AdminOrderService;
use crate::ledger::BalanceLedger;
use crate::poller::StatusPoller;
use crate::store::EntityStore;
use crate::submission::OrderSubmitter;

/// Shared state for the admin HTTP surface
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EntityStore>,
    pub ledger: Arc<BalanceLedger>,
    pub submitter: Arc<OrderSubmitter>,
    pub admin: Arc<AdminOrderService>,
    /// Used by the manual poll trigger
    pub poller: Arc<StatusPoller>,
    pub auth: Arc<JwtAuth>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn EntityStore>,
        ledger: Arc<BalanceLedger>,
        submitter: Arc<OrderSubmitter>,
        admin: Arc<AdminOrderService>,
        poller: Arc<StatusPoller>,
        auth: Arc<JwtAuth>,
    ) -> Self {
        Self {
            store,
            ledger,
            submitter,
            admin,
            poller,
            auth,
        }
    }
}
