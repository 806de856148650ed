//! sslocal - CLI entry point for the local proxy.

// mimalloc keeps allocation latency flat under relay churn.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use sslocal_rust::{App, Config, VERSION};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "sslocal")]
#[command(version = VERSION)]
#[command(about = "Shadowsocks local proxy (SOCKS5 front-end)")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Per-connection logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Validate the configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("sslocal-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load {}: {}", args.config.display(), e);
            std::process::exit(1);
        }
    };
    if args.verbose {
        config.verbose = true;
    }

    let default_level = if config.verbose {
        "sslocal_rust=debug"
    } else {
        "sslocal_rust=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.parse()?),
        )
        .init();

    info!("sslocal v{}", VERSION);

    if args.test {
        info!("configuration test passed");
        return Ok(());
    }

    let app = match App::new(config).await {
        Ok(app) => app,
        Err(e) => {
            error!("startup failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = app.run().await {
        error!("{}", e);
        std::process::exit(1);
    }

    Ok(())
}
