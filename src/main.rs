use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use xg2g::config::{self, AppConfig};
use xg2g::events::EventBus;
use xg2g::pipeline::{FfmpegPipeline, MediaPipeline, StubPipeline};
use xg2g::receiver::{BreakerConfig, Enigma2Client, GuardedReceiver, Receiver};
use xg2g::resources::ResourceMonitor;
use xg2g::state::AppState;
use xg2g::store::{SqliteStore, StateStore};
use xg2g::sweeper::Sweeper;
use xg2g::vod::VodResolver;
use xg2g::web;
use xg2g::worker::Orchestrator;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// xg2g command line arguments
#[derive(Parser, Debug)]
#[command(name = "xg2g")]
#[command(version, about = "Streaming-session orchestrator for set-top receivers", long_about = None)]
struct CliArgs {
    /// Configuration file (JSON); defaults from XG2G_CONFIG
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Data directory for state databases (default: /var/lib/xg2g)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    listen: Option<String>,

    /// Run with the stub pipeline instead of ffmpeg (dry runs, demos)
    #[arg(long)]
    stub_pipeline: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting xg2g v{}", env!("CARGO_PKG_VERSION"));

    // Configuration is loaded exactly once; everything downstream gets the
    // snapshot. Unknown keys abort startup.
    let config_path = config::resolve_config_path(args.config);
    let mut cfg = config::load(config_path.as_deref())?;
    if let Some(listen) = args.listen {
        cfg.api.listen_addr = listen;
    }
    config::validate(&cfg)?;
    let cfg = Arc::new(cfg);

    let data_dir = config::resolve_data_dir(args.data_dir);
    tracing::info!(data_dir = %data_dir.display(), "data directory");
    tokio::fs::create_dir_all(&data_dir).await?;
    tokio::fs::create_dir_all(std::path::Path::new(&cfg.hls.root).join("sessions")).await?;

    let store: Arc<dyn StateStore> = Arc::new(SqliteStore::open(&data_dir).await?);
    let bus = Arc::new(EventBus::new());
    let resources = ResourceMonitor::new(cfg.limits.max_pool, cfg.limits.gpu_tokens);

    let enigma2: Arc<dyn Receiver> = Arc::new(Enigma2Client::new(&cfg.enigma2)?);
    let receiver = Arc::new(GuardedReceiver::new(enigma2, BreakerConfig::default()));

    let pipeline: Arc<dyn MediaPipeline> = if args.stub_pipeline {
        tracing::warn!("running with the stub pipeline; no real media is produced");
        Arc::new(StubPipeline::default())
    } else {
        Arc::new(FfmpegPipeline::new(cfg.ffmpeg.clone(), cfg.enigma2.clone()))
    };

    let vod = Arc::new(VodResolver::new(
        store.clone(),
        cfg.ffmpeg.ffprobe_bin.clone(),
        &cfg.vod,
        cfg.recording_path_mappings.clone(),
    ));

    let state = AppState::new(
        cfg.clone(),
        store.clone(),
        bus.clone(),
        resources.clone(),
        receiver.clone(),
        vod,
    );

    // Background loops: orchestrator consumes the bus, sweeper reclaims
    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(
        &cfg,
        store.clone(),
        bus.clone(),
        pipeline,
        receiver,
        resources,
    );
    orchestrator.spawn(shutdown.clone());
    let sweeper = Sweeper::new(&cfg, store.clone());
    sweeper.spawn(shutdown.clone());

    let router = web::create_router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.api.listen_addr).await?;
    tracing::info!(addr = cfg.api.listen_addr.as_str(), "API listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            serve_shutdown.cancel();
        })
        .await?;

    // Give background loops a moment to drain their sessions
    shutdown.cancel();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    tracing::info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("ctrl-c handler installs");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("sigterm handler installs")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "xg2g=error,tower_http=error",
        LogLevel::Warn => "xg2g=warn,tower_http=warn",
        LogLevel::Info => "xg2g=info,tower_http=info",
        LogLevel::Debug => "xg2g=debug,tower_http=debug",
        LogLevel::Trace => "xg2g=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {err}");
    }
}
