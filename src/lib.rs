use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

pub mod api;
pub mod bus;
pub mod config;
pub mod graph;
pub mod health;
pub mod kv;
pub mod metrics;
pub mod presence;
pub mod session;

use crate::api::AppState;
use crate::bus::{FanoutBus, LocalBus, RedisBus};
use crate::config::Config;
use crate::graph::{CachedGraph, FollowGraph, MemoryGraph, RedisGraph};
use crate::health::HealthMonitor;
use crate::kv::{KvStore, MemoryKv, RedisKv};
use crate::presence::reaper::Reaper;
use crate::presence::PresenceStore;
use crate::session::SessionRegistry;

#[derive(Parser)]
#[command(name = "presenced")]
#[command(about = "Real-time user presence service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the presence server with an in-process reaper (default)
    Start {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Use an in-process KV and bus instead of redis (single node, dev only)
        #[arg(long)]
        embedded: bool,
    },
    /// Run a standalone reaper process against the shared KV
    Reaper {
        /// Seconds to sleep between polls
        #[arg(long)]
        poll_interval: Option<f64>,
        /// Max number of expired users to process per poll
        #[arg(long)]
        batch_size: Option<usize>,
        /// Sweep only this shard (all shards when omitted)
        #[arg(long)]
        shard_id: Option<u32>,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for config file
        #[arg(short, long, default_value = "presenced.toml")]
        output: String,
    },
    /// Check that the shared KV is reachable
    Status,
    /// Generate a JWT token for socket authentication
    Token {
        /// User id for the token subject
        #[arg(short, long)]
        user: i64,
        /// Token expiry in seconds
        #[arg(short, long, default_value = "86400")]
        expiry_seconds: u64,
    },
}

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path).await?,
        None => Config::from_env(),
    };

    // Initialize Logging/Tracing
    let level = config.logging.level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    match cli.command {
        Some(Commands::Start { port, embedded }) => {
            let mut config = config;
            if let Some(port) = port {
                config.server.port = port;
            }
            start_server(config, embedded).await?;
        }
        Some(Commands::Reaper {
            poll_interval,
            batch_size,
            shard_id,
        }) => {
            let mut config = config;
            if let Some(poll_interval) = poll_interval {
                config.reaper.poll_interval_seconds = poll_interval;
            }
            if let Some(batch_size) = batch_size {
                config.reaper.batch_size = batch_size;
            }
            run_reaper(config, shard_id).await?;
        }
        Some(Commands::Init { output }) => {
            run_init(&output).await?;
        }
        Some(Commands::Status) => {
            run_status(&config).await?;
        }
        Some(Commands::Token {
            user,
            expiry_seconds,
        }) => {
            let token = api::middleware::issue_token(user, expiry_seconds)?;
            println!("{}", token);
        }
        None => {
            start_server(config, false).await?;
        }
    }

    Ok(())
}

async fn start_server(config: Config, embedded: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting presenced...");
    config
        .validate()
        .map_err(|errors| errors.join("; "))?;

    // 1. Shared KV and fanout fabric
    let (kv, bus): (Arc<dyn KvStore>, Arc<dyn FanoutBus>) = if embedded {
        info!("Embedded mode: in-process KV and bus, no cross-instance fanout.");
        (Arc::new(MemoryKv::new()), Arc::new(LocalBus::default()))
    } else {
        let kv = RedisKv::connect(&config.redis.url).await?;
        let bus = RedisBus::connect(&config.redis.url, 1024).await?;
        (Arc::new(kv), Arc::new(bus))
    };
    info!("KV and fanout bus ready.");

    // 2. Follow graph, with a positive-answer cache for subscribe bursts
    let graph: Arc<dyn FollowGraph> = if embedded {
        Arc::new(MemoryGraph::new())
    } else {
        Arc::new(CachedGraph::with_defaults(
            RedisGraph::connect(&config.redis.url).await?,
        ))
    };
    info!("Follow graph adapter ready.");

    // 3. Presence store and in-process reaper
    let store = Arc::new(PresenceStore::new(kv.clone(), config.presence.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = Reaper::new(store.clone(), bus.clone(), &config.reaper);
    let reaper_handle = tokio::spawn(reaper.run(shutdown_rx));
    info!("Reaper loop started.");

    // 4. Sessions, health, API server
    let registry = Arc::new(SessionRegistry::new());
    let health = HealthMonitor::new(kv.clone());
    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        kv,
        bus,
        graph,
        registry,
        health,
    });
    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("presenced listening on {}", addr);
    info!("  - WebSocket: ws://{}/ws/presence?token=<jwt>", addr);
    info!("  - Leaderboard: http://{}/presence/leaderboard", addr);
    info!("  - Health: http://{}/health", addr);
    info!("  - Metrics: http://{}/metrics", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the reaper between ticks; an in-flight tick completes.
    let _ = shutdown_tx.send(true);
    let _ = reaper_handle.await;
    info!("presenced stopped.");

    Ok(())
}

async fn run_reaper(config: Config, shard_id: Option<u32>) -> Result<(), Box<dyn std::error::Error>> {
    config
        .validate()
        .map_err(|errors| errors.join("; "))?;
    if let Some(shard) = shard_id {
        if shard >= config.presence.num_shards {
            return Err(format!(
                "shard_id {} out of range, {} shards configured",
                shard, config.presence.num_shards
            )
            .into());
        }
    }

    let kv: Arc<dyn KvStore> = Arc::new(RedisKv::connect(&config.redis.url).await?);
    let bus: Arc<dyn FanoutBus> = Arc::new(RedisBus::connect(&config.redis.url, 1024).await?);
    let store = Arc::new(PresenceStore::new(kv, config.presence.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let mut reaper = Reaper::new(store, bus, &config.reaper);
    if let Some(shard) = shard_id {
        reaper = reaper.with_shard(shard);
    }
    reaper.run(shutdown_rx).await;
    Ok(())
}

async fn run_init(output: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    tokio::fs::write(output, config.export_toml()?).await?;
    println!("Wrote default configuration to {}", output);
    Ok(())
}

async fn run_status(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    match RedisKv::connect(&config.redis.url).await {
        Ok(kv) => match kv.ping().await {
            Ok(()) => {
                println!("kv ok: {}", config.redis.url);
                Ok(())
            }
            Err(e) => {
                println!("kv unreachable: {}", e);
                Err(Box::new(e))
            }
        },
        Err(e) => {
            println!("kv connection failed: {}", e);
            Err(Box::new(e))
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
