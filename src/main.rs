use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::services::ServeDir;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use amarquran::api::{auth, metrics, rate_limit};
use amarquran::config::Config;
use amarquran::engine::{self, MeetingSync, MeetingSyncEngine};
use amarquran::meetings::MeetingProviders;
use amarquran::notifications::NotificationService;
use amarquran::payments::PaymentGateways;
use amarquran::AppState;

/// Meeting jobs waiting for the sync engine
const MEETING_QUEUE_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "amarquran")]
#[command(author, version, about = "Live Qur'an classes: booking, meetings, payments", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "amarquran.toml", env = "AMARQURAN_CONFIG")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long, env = "AMARQURAN_LOG_LEVEL")]
    log_level: Option<String>,

    /// Bootstrap admin password, overriding the config file
    #[arg(long, env = "AMARQURAN_ADMIN_PASSWORD", hide_env_values = true)]
    admin_password: Option<String>,

    /// Microsoft Graph client secret, overriding the config file
    #[arg(long, env = "AMARQURAN_TEAMS_CLIENT_SECRET", hide_env_values = true)]
    teams_client_secret: Option<String>,

    /// Stripe secret key, overriding the config file
    #[arg(long, env = "AMARQURAN_STRIPE_SECRET_KEY", hide_env_values = true)]
    stripe_secret_key: Option<String>,

    /// SSLCommerz store password, overriding the config file
    #[arg(long, env = "AMARQURAN_SSLCOMMERZ_PASSWORD", hide_env_values = true)]
    sslcommerz_password: Option<String>,
}

impl Cli {
    fn apply_secrets(&self, config: &mut Config) {
        if let Some(password) = &self.admin_password {
            config.auth.admin_password = Some(password.clone());
        }
        if let (Some(secret), Some(teams)) = (&self.teams_client_secret, config.meetings.teams.as_mut()) {
            teams.client_secret = secret.clone();
        }
        if let (Some(key), Some(stripe)) = (&self.stripe_secret_key, config.payments.stripe.as_mut()) {
            stripe.secret_key = key.clone();
        }
        if let (Some(password), Some(ssl)) = (&self.sslcommerz_password, config.payments.sslcommerz.as_mut()) {
            ssl.store_password = password.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    cli.apply_secrets(&mut config);

    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Amar Quran v{}", env!("CARGO_PKG_VERSION"));

    let offset = config.server.utc_offset();
    let db = amarquran::db::init(&config.server.data_dir).await?;
    auth::ensure_admin_user(&db, &config.auth).await?;

    let metrics_handle = match metrics::init_metrics() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Prometheus recorder not installed, /metrics disabled");
            None
        }
    };

    let notifier = Arc::new(NotificationService::from_config(db.clone(), &config.notifications)?);
    let providers = MeetingProviders::from_config(&config.meetings)?;
    let payments = Arc::new(PaymentGateways::from_config(&config.payments));

    // Meeting sync engine: the only place provider calls happen
    let (meeting_tx, meeting_rx) = mpsc::channel(MEETING_QUEUE_CAPACITY);
    let sync = MeetingSync::new(db.clone(), providers, notifier.clone(), offset);
    tokio::spawn(MeetingSyncEngine::new(sync, meeting_rx).run());

    engine::spawn_reminder_task(db.clone(), notifier.clone(), &config.notifications, offset);
    engine::spawn_backup_task(db.clone(), config.backup.clone(), config.server.data_dir.clone()).await;
    if config.reports.weekly_enabled {
        engine::spawn_weekly_report_task(db.clone(), notifier.clone(), offset);
    }

    let mut state = AppState::new(config.clone(), db.clone(), meeting_tx, notifier, payments);
    if let Some(handle) = metrics_handle {
        state = state.with_metrics(handle);
    }
    let state = Arc::new(state);
    rate_limit::spawn_cleanup_task(state.rate_limiter.clone(), config.rate_limit.cleanup_interval);

    // Nginx serves /media in production; this keeps uploads reachable when running bare
    let app = amarquran::api::create_router(state)
        .nest_service("/media", ServeDir::new(&config.backup.media_dir));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
