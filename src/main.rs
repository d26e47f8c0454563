use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use reseller_ledger::admin::AdminOrderService;
use reseller_ledger::config::AppConfig;
use reseller_ledger::gateway::{self, AppState, JwtAuth};
use reseller_ledger::notify::{EmailSender, LogEmailSender, WebhookEmailSender};
use reseller_ledger::poller::StatusPoller;
use reseller_ledger::provider::{MapperRegistry, ReqwestTransport, SubmissionAdapter};
use reseller_ledger::reconciliation::ReconciliationWorker;
use reseller_ledger::{BalanceLedger, EntityStore, MemoryStore, OrderSubmitter};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn get_port_override() -> Option<u16> {
    let args: Vec<String> = std::env::args().collect();
    args.windows(2)
        .find(|pair| pair[0] == "--port")
        .and_then(|pair| pair[1].parse().ok())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = reseller_ledger::logging::init_logging(&config.logging);

    info!(env = %env, git_hash = env!("GIT_HASH"), "Starting reseller ledger");

    let memory = match &config.seed_file {
        Some(path) => MemoryStore::load_seed_file(path)
            .with_context(|| format!("Failed to load seed file {path}"))?,
        None => MemoryStore::new(),
    };
    let store: Arc<dyn EntityStore> = Arc::new(memory);

    let ledger = Arc::new(BalanceLedger::with_max_retries(
        store.clone(),
        config.ledger.max_cas_retries,
    ));
    let mappers = Arc::new(MapperRegistry::with_rules(config.provider.rules.clone()));
    let adapter_config = config.provider.adapter_config();
    let transport = ReqwestTransport::new(adapter_config.timeout)
        .context("Failed to build provider HTTP client")?;
    let adapter = Arc::new(SubmissionAdapter::new(Arc::new(transport), adapter_config));

    let email: Arc<dyn EmailSender> = match &config.email.webhook_url {
        Some(url) => Arc::new(
            WebhookEmailSender::new(url.clone(), Duration::from_secs(config.email.timeout_secs))
                .context("Failed to build email webhook client")?,
        ),
        None => {
            warn!("No email webhook configured, notifications are only logged");
            Arc::new(LogEmailSender)
        }
    };

    let submitter = Arc::new(OrderSubmitter::new(
        store.clone(),
        ledger.clone(),
        mappers.clone(),
        adapter.clone(),
    ));
    let admin = Arc::new(AdminOrderService::new(store.clone(), ledger.clone()));
    let poller = Arc::new(StatusPoller::new(
        store.clone(),
        mappers,
        adapter,
        email,
        config.poller.poller_config(),
    ));

    if config.poller.enabled {
        let poller = poller.clone();
        tokio::spawn(async move { poller.run().await });
    }
    if config.reconciliation.enabled {
        let worker = ReconciliationWorker::new(
            store.clone(),
            ledger.clone(),
            config.reconciliation.reconciliation_config(),
        );
        tokio::spawn(async move { worker.run().await });
    }

    let auth = Arc::new(JwtAuth::new(
        config.auth.jwt_secret.clone(),
        config.auth.token_ttl_secs,
    ));
    let state = Arc::new(AppState::new(store, ledger, submitter, admin, poller, auth));

    let port = get_port_override().unwrap_or(config.gateway.port);
    let addr: SocketAddr = format!("{}:{}", config.gateway.host, port)
        .parse()
        .context("Invalid gateway address")?;

    gateway::run_server(addr, state, shutdown_signal()).await?;
    info!("Gateway stopped");
    Ok(())
}
