use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mailroom::api::{self, ApiState};
use mailroom::config::{PipelineConfig, StoreConfig, api_port_from_env};
use mailroom::enrich::Enrichers;
use mailroom::llm::{LlmConfig, create_provider};
use mailroom::mailbox::{ImapMailbox, Mailbox, MailboxConfig};
use mailroom::pipeline::{PipelineDeps, Supervisor};
use mailroom::store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("Warning: a rustls crypto provider was already installed");
    }

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing();

    let pipeline_config = PipelineConfig::from_env()?;
    let store_config = StoreConfig::from_env();
    let mailbox_config = MailboxConfig::from_env()?;
    let api_port = api_port_from_env()?;
    let role = pipeline_config.role;

    eprintln!("📬 Mailroom v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Role: {}", role.as_str());

    // ── Store ────────────────────────────────────────────────────────────
    let store = store::connect(&store_config)
        .await
        .context("failed to open item store")?;
    match &store_config {
        StoreConfig::Local(path) => eprintln!("   Database: {}", path.display()),
        StoreConfig::Remote { url, .. } => eprintln!("   Database: {url}"),
    }

    // ── Mailbox ──────────────────────────────────────────────────────────
    let (mailbox, allowed_senders, own_address) = match mailbox_config {
        Some(config) => {
            eprintln!(
                "   Mailbox: {} (IMAP: {}, SMTP: {})",
                config.username, config.imap_host, config.smtp_host
            );
            let allowed = config.allowed_senders.clone();
            let own = Some(config.from_address.clone()).filter(|a| !a.is_empty());
            let mailbox: Arc<dyn Mailbox> = Arc::new(ImapMailbox::new(config));
            (Some(mailbox), allowed, own)
        }
        None => {
            eprintln!("   Mailbox: not configured");
            (None, Vec::new(), None)
        }
    };

    // ── Enrichment ───────────────────────────────────────────────────────
    let enrichers = if role.runs_consumers() {
        let llm_config = LlmConfig::from_env()?;
        let llm = create_provider(&llm_config)?;
        eprintln!(
            "   Model: {} via {} ({} workers)",
            llm.model_name(),
            llm_config.backend,
            pipeline_config.consumer_workers
        );
        Some(Enrichers::from_llm(llm))
    } else {
        None
    };

    // ── Pipeline ─────────────────────────────────────────────────────────
    let supervisor = Arc::new(Supervisor::start(
        pipeline_config,
        PipelineDeps {
            store: Arc::clone(&store),
            mailbox: mailbox.clone(),
            enrichers: enrichers.clone(),
            allowed_senders,
            own_address,
        },
    )?);

    // ── API ──────────────────────────────────────────────────────────────
    let app = api::router(ApiState {
        store,
        supervisor: Some(Arc::clone(&supervisor)),
        producer: supervisor.producer(),
        mailbox,
        enrichers,
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{api_port}"))
        .await
        .with_context(|| format!("failed to bind API port {api_port}"))?;
    eprintln!("   API: http://0.0.0.0:{api_port}\n");
    tracing::info!(port = api_port, "API server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
        .context("API server failed")?;

    supervisor.shutdown().await;
    Ok(())
}

/// Console logging filtered by `RUST_LOG` (default `info`), plus a daily
/// rolling file under `MAILROOM_LOG_DIR` when set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match std::env::var("MAILROOM_LOG_DIR").ok().filter(|d| !d.is_empty()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mailroom.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            None
        }
    }
}
