//! Command-line front end for the gateway
//!
//! `tmfpdp serve` runs the authorization gateway; `tmfpdp sync` drives
//! the catalog cloner by hand (once, periodically, or for cache
//! maintenance).

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::time::Duration;

use pdp_service::cloner::Cloner;
use pdp_service::config::{Config, Environment};
use pdp_service::routes;
use pdp_service::server::Server;
use pdp_service::store::TmfCache;
use pdp_service::upstream::UpstreamClient;
use pdp_service::AppState;

#[derive(Parser)]
#[command(name = "tmfpdp", about = "TMF marketplace authorization gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway server
    Serve(ServeArgs),
    /// Run the catalog cloner or maintain the cache
    Sync(SyncArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Deployment environment
    #[arg(long, default_value = "sbx")]
    env: Environment,

    /// Listen address, overriding the configuration
    #[arg(long)]
    listen: Option<String>,
}

#[derive(Args)]
struct SyncArgs {
    /// Deployment environment
    #[arg(long, default_value = "sbx")]
    env: Environment,

    /// Shorthand for --env pro
    #[arg(long, conflicts_with = "env")]
    production: bool,

    /// Keep cloning on this period, in seconds
    #[arg(long)]
    refresh: Option<u64>,

    /// Print one cached object and exit
    #[arg(long, value_name = "ID")]
    dump: Option<String>,

    /// Drop every cached row and exit
    #[arg(long)]
    delete: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Sync(args) => sync(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = Config::load(args.env).context("loading configuration")?;
    if let Some(listen) = args.listen {
        config.service.listen = listen;
    }
    pdp_service::init_tracing(&config.service.log_level);

    let state = AppState::from_config(config.clone())
        .await
        .context("starting gateway")?;

    let cloner = Cloner::new(
        state.cache.clone(),
        state.upstream.clone(),
        config.cloner.clone(),
    );
    let scheduler = cloner.spawn_scheduler();

    let result = Server::new(config).serve(routes::router(state)).await;

    cloner.shutdown();
    scheduler.abort();
    result.context("serving")
}

async fn sync(args: SyncArgs) -> anyhow::Result<()> {
    let env = if args.production {
        Environment::Pro
    } else {
        args.env
    };
    let config = Config::load(env).context("loading configuration")?;
    pdp_service::init_tracing(&config.service.log_level);

    let cache = TmfCache::open(&config.database.path, &config.database)
        .await
        .context("opening cache database")?;

    if args.delete {
        let dropped = cache.clear().await.context("clearing cache")?;
        println!("dropped {dropped} cached objects from {}", config.database.path);
        return Ok(());
    }

    if let Some(id) = args.dump {
        let obj = cache
            .retrieve(&id, None)
            .await
            .context("reading cache")?
            .with_context(|| format!("{id} is not cached"))?;
        println!("{}", serde_json::to_string_pretty(&obj.content)?);
        return Ok(());
    }

    let upstream = UpstreamClient::new(&config.upstream).context("building upstream client")?;
    let cloner = Cloner::new(cache, upstream, config.cloner.clone());

    match args.refresh {
        None => {
            let stats = cloner.run_once().await.context("clone pass")?;
            println!(
                "cloned {} roots: {} written, {} refreshed, {} unchanged, {} failed",
                stats.roots, stats.written, stats.refreshed, stats.unchanged, stats.failed_roots
            );
        }
        Some(secs) => {
            let period = Duration::from_secs(secs.max(1));
            loop {
                if let Err(e) = cloner.run_once().await {
                    tracing::error!("clone pass failed: {e}");
                }
                tokio::time::sleep(period).await;
            }
        }
    }
    Ok(())
}
