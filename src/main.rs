use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::watch;

use outreach_sequencer::api::operator_routes;
use outreach_sequencer::config::{MailBackendConfig, SequencerConfig};
use outreach_sequencer::dispatch::DispatchPipeline;
use outreach_sequencer::limiter::RateLimiter;
use outreach_sequencer::mail::{
    FileTemplateRenderer, GraphMailClient, ImapMailboxReader, MailSender, MailboxReader,
    SmtpMailSender,
};
use outreach_sequencer::replies::{ReplyClassifier, ReplyDetector, spawn_reply_poller};
use outreach_sequencer::scheduler::{Scheduler, spawn_scheduler};
use outreach_sequencer::store::{LibSqlBackend, SequenceRepository};
use outreach_sequencer::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("Warning: a rustls crypto provider was already installed");
    }

    let config = match SequencerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };

    let _telemetry = telemetry::init(config.log_dir.as_deref());

    eprintln!("📬 Outreach Sequencer v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Sender: {}", config.sender_email);
    eprintln!("   Backend: {}", config.backend.name());
    eprintln!(
        "   Rate limit: {}/min, {}/day",
        config.rate_limit_per_minute, config.rate_limit_per_day
    );

    // ── Database ─────────────────────────────────────────────────────────
    let repo: Arc<dyn SequenceRepository> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Mail backend ─────────────────────────────────────────────────────
    let (sender, mailbox): (Arc<dyn MailSender>, Arc<dyn MailboxReader>) = match &config.backend {
        MailBackendConfig::Graph(graph) => {
            let client = Arc::new(GraphMailClient::new(graph.clone())?);
            let sender: Arc<dyn MailSender> = client.clone();
            let mailbox: Arc<dyn MailboxReader> = client;
            (sender, mailbox)
        }
        MailBackendConfig::Smtp { smtp, imap } => {
            let sender: Arc<dyn MailSender> = Arc::new(SmtpMailSender::new(smtp)?);
            let mailbox: Arc<dyn MailboxReader> = Arc::new(ImapMailboxReader::new(imap.clone()));
            (sender, mailbox)
        }
    };

    let plan = config.sequence_plan();
    let renderer = Arc::new(
        FileTemplateRenderer::load(&config.template_dir, plan.email_count()).with_context(
            || format!("failed to load templates from {}", config.template_dir.display()),
        )?,
    );
    eprintln!(
        "   Templates: {} ({} emails per sequence)",
        config.template_dir.display(),
        plan.email_count()
    );

    // ── Reply detection ──────────────────────────────────────────────────
    let classifier = ReplyClassifier::default_rules()
        .and_then(|c| c.with_auto_reply_patterns(&config.auto_reply_patterns))
        .context("invalid AUTO_REPLY_SUBJECT_PATTERNS")?;
    let detector = Arc::new(ReplyDetector::new(
        Arc::clone(&repo),
        mailbox,
        classifier,
        &config.sender_email,
        config.send_timeout(),
        Utc::now() - chrono::Duration::hours(1),
    ));

    // ── Scheduler ────────────────────────────────────────────────────────
    let pipeline = DispatchPipeline::new(sender, renderer, config.send_timeout());
    let scheduler = Arc::new(
        Scheduler::new(
            Arc::clone(&repo),
            Arc::new(RateLimiter::new(config.limiter_config())),
            pipeline,
            plan,
            config.retry_policy(),
            config.scheduler_config(),
        )
        .with_reply_detector(Arc::clone(&detector)),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = spawn_scheduler(Arc::clone(&scheduler), shutdown_rx.clone());

    let reply_interval = config
        .reply_check_interval()
        .to_std()
        .unwrap_or(std::time::Duration::from_secs(900));
    let poller_handle = spawn_reply_poller(detector, reply_interval, shutdown_rx.clone());

    // ── Operator API ─────────────────────────────────────────────────────
    let api_handle = if config.api_port == 0 {
        eprintln!("   API: disabled");
        None
    } else {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.api_port))
            .await
            .with_context(|| format!("failed to bind API port {}", config.api_port))?;
        eprintln!("   API: http://0.0.0.0:{}/api/status", config.api_port);
        let app = operator_routes(Arc::clone(&scheduler));
        let mut api_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = api_shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!("Operator API stopped: {e}");
            }
        }))
    };

    tracing::info!("Sequencer running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("Shutdown requested, finishing in-flight work");
    let _ = shutdown_tx.send(true);

    let _ = scheduler_handle.await;
    let _ = poller_handle.await;
    if let Some(handle) = api_handle {
        let _ = handle.await;
    }

    tracing::info!("Sequencer stopped");
    Ok(())
}
