//! overseer - HTTP server entry point.
//!
//! Starts the orchestrator control loop and the operator API.

use std::sync::Arc;

use overseer::backlog::SqliteBacklog;
use overseer::engine::{ProcessCodeGenAgent, ProcessTestRunner};
use overseer::vcs::HttpVcsHost;
use overseer::{api, Config, Orchestrator, SafetyLimits, SafetyMonitor};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "overseer=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: sessions={} attempts={} cost_cap={}c",
        config.max_concurrent_sessions,
        config.max_attempts_per_session,
        config.max_cost_per_session_cents
    );

    let store = Arc::new(SqliteBacklog::open(config.backlog_db_path.clone()).await?);
    let vcs = Arc::new(HttpVcsHost::new(
        &config.vcs_base_url,
        config.vcs_token.clone(),
    )?);
    let agent = Arc::new(ProcessCodeGenAgent::new(config.agent_command.clone()));
    let tests = Arc::new(ProcessTestRunner::new(config.test_command.clone()));
    let monitor = Arc::new(SafetyMonitor::new(SafetyLimits::from(&config)));

    let orchestrator = Orchestrator::new(&config, store, agent, tests, vcs, monitor);

    // Control loop runs alongside the HTTP server; the server's graceful
    // shutdown stops the loop and drains in-flight sessions.
    let control_loop = orchestrator.clone();
    tokio::spawn(async move {
        control_loop.run().await;
    });

    api::serve(config, orchestrator).await?;

    Ok(())
}
