use std::sync::Arc;

use {
    clap::Parser,
    tracing::{error, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {camofox_browser::Core, camofox_engine::cdp::CdpEngine};

#[derive(Parser)]
#[command(name = "camofox", about = "camofox — multi-tenant browser control plane")]
struct Cli {
    /// Port to listen on (overrides CAMOFOX_PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Path to the browser executable (auto-detected if not set).
    #[arg(long, env = "CAMOFOX_BROWSER_PATH")]
    browser_path: Option<std::path::PathBuf>,
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    // Uncaught panics terminate the process after logging; a wedged half
    // process is worse than a restart.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!(%panic_info, "uncaught panic, terminating");
        default_hook(panic_info);
        std::process::exit(1);
    }));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = camofox_config::load_from_env()?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    let config = Arc::new(config);

    let mut engine = CdpEngine::new();
    if let Some(ref path) = cli.browser_path {
        engine = engine.with_chrome_path(path.clone());
    }

    let core = Core::init(Arc::clone(&config), Arc::new(engine)).await?;

    let shutdown_core = Arc::clone(&core);
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        shutdown_core.health.set_recovering(true);
    };

    camofox_gateway::serve(Arc::clone(&core), shutdown).await?;

    core.shutdown().await;
    info!("bye");
    Ok(())
}
