use std::sync::Arc;

use anyhow::Context;

use velu::api::{self, AppState};
use velu::config::{OrchestratorConfig, ServerConfig};
use velu::runtime::Orchestrator;
use velu::store::{JobStore, LibSqlBackend};
use velu::tasks::TaskRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let server_config = ServerConfig::from_env().context("invalid server configuration")?;
    let orchestrator_config =
        OrchestratorConfig::from_env().context("invalid orchestrator configuration")?;

    eprintln!("Velu v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://{}", server_config.bind);
    eprintln!("   Workers: {}", orchestrator_config.workers);
    eprintln!(
        "   Auth: {}",
        if server_config.api_keys.is_empty() {
            "disabled (development mode)".to_string()
        } else {
            format!("{} api key(s)", server_config.api_keys.len())
        }
    );
    if server_config.rate_limit_enabled() {
        eprintln!(
            "   Rate limit: {} per {}s",
            server_config.rate_requests,
            server_config.rate_window.as_secs()
        );
    }

    // ── Database ─────────────────────────────────────────────────────────
    let backend: Arc<dyn JobStore> = Arc::new(
        LibSqlBackend::new_local(&server_config.db_path)
            .await
            .with_context(|| {
                format!("failed to open database at {}", server_config.db_path.display())
            })?,
    );
    eprintln!("   Database: {}", server_config.db_path.display());

    // ── Orchestrator ─────────────────────────────────────────────────────
    let registry = TaskRegistry::with_builtins();
    eprintln!("   Tasks: {}", registry.list().join(", "));
    let orchestrator = Orchestrator::start(backend, registry, orchestrator_config)
        .await
        .context("failed to start orchestrator")?;

    // ── HTTP ─────────────────────────────────────────────────────────────
    let bind = server_config.bind.clone();
    let app = api::router(AppState::new(orchestrator.dispatcher(), server_config));
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %bind, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("server error")?;

    orchestrator.shutdown().await;
    Ok(())
}
