//! CoreRPC - Concurrent RPC over a single persistent connection
//!
//! Runs a demo server or issues calls against one.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use corerpc::config::{self, Config};
use corerpc::network::Client;
use corerpc::protocol::{self, CodecType, Handshake};
use corerpc::service::{Router, Service};
use corerpc::Server;

/// CoreRPC - Concurrent request/response RPC
#[derive(Parser)]
#[command(name = "corerpc")]
#[command(author = "CoreRPC Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Concurrent RPC over a single persistent connection", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo Echo and Arith services
    Serve {
        /// Address to bind
        #[arg(short, long)]
        bind: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Call a running server
    Call {
        /// Server address (host:port, or host with --port)
        #[arg(short, long)]
        server: String,

        /// Server port when --server has none
        #[arg(short, long)]
        port: Option<u16>,

        /// Remote method taking and returning a string
        #[arg(short, long, default_value = "Echo.Echo")]
        method: String,

        /// Argument sent with every call
        #[arg(short, long, default_value = "hello")]
        arg: String,

        /// Number of concurrent calls
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,

        /// Codec to negotiate (bincode or json)
        #[arg(long)]
        codec: Option<CodecType>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let (config, config_error) = if let Some(config_path) = &cli.config {
        (Config::load(config_path)?, None)
    } else {
        match Config::load_default() {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        }
    };

    // Initialize logging
    let filter = match &config.general.log_filter {
        Some(directive) if !cli.verbose => EnvFilter::try_new(directive)?,
        _ if cli.verbose || config.general.verbose => EnvFilter::new("debug"),
        _ => EnvFilter::new("info"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    if let Some(e) = config_error {
        tracing::warn!("Ignoring configuration file, using defaults: {}", e);
    }

    match cli.command {
        Commands::Serve { bind, port } => {
            run_server(config, bind, port).await?;
        }
        Commands::Call {
            server,
            port,
            method,
            arg,
            count,
            codec,
        } => {
            run_calls(config, server, port, method, arg, count, codec).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Services exposed by `corerpc serve`
fn demo_router() -> anyhow::Result<Router> {
    let mut router = Router::new();

    router.register(
        Service::new("Echo")
            .method("Echo", |s: String| async move { Ok::<_, String>(s) })
            .method("Upper", |s: String| async move { Ok::<_, String>(s.to_uppercase()) }),
    )?;

    router.register(
        Service::new("Arith")
            .method("Add", |(a, b): (i64, i64)| async move {
                a.checked_add(b).ok_or_else(|| "integer overflow".to_string())
            })
            .method("Div", |(a, b): (i64, i64)| async move {
                if b == 0 {
                    Err("divide by zero".to_string())
                } else {
                    Ok(a / b)
                }
            }),
    )?;

    Ok(router)
}

/// Run the demo server until Ctrl+C
async fn run_server(config: Config, bind: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let mut file_config = config.network;
    if let Some(bind) = bind {
        file_config.bind_address = bind;
    }
    if let Some(port) = port {
        file_config.port = port;
    }

    let router = Arc::new(demo_router()?);
    let mut server = Server::new(file_config.to_runtime()?, router.clone());
    let local_addr = server.start(&file_config.listen_addr()).await?;

    println!("\n========================================");
    println!("  CoreRPC Server Running");
    println!("========================================");
    println!("  Address: {}", local_addr);
    println!("  Protocol: v{}", protocol::PROTOCOL_VERSION);
    for name in router.services() {
        if let Some(service) = router.service(name) {
            println!("  {}: {}", name, service.method_names().join(", "));
        }
    }
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    server.stop().await?;

    for name in router.services() {
        if let Some(service) = router.service(name) {
            for method in service.method_names() {
                let calls = service.num_calls(method).unwrap_or(0);
                tracing::info!("{}.{}: {} calls", name, method, calls);
            }
        }
    }
    tracing::info!("Server stopped");

    Ok(())
}

/// Issue `count` concurrent calls and print the replies
async fn run_calls(
    config: Config,
    server: String,
    port: Option<u16>,
    method: String,
    arg: String,
    count: usize,
    codec: Option<CodecType>,
) -> anyhow::Result<()> {
    let mut net_config = config.network.to_runtime()?;
    if let Some(codec) = codec {
        net_config.codec = codec;
    }

    let addr = if server.contains(':') {
        server
    } else {
        let port = port.unwrap_or(config.network.port);
        corerpc::network::resolve_host(&server, port).await?.to_string()
    };

    let client =
        Client::dial_with_config(&addr, Handshake::new(net_config.codec), &net_config).await?;

    let calls: Vec<_> = (0..count)
        .map(|i| {
            let arg = if count > 1 { format!("{} #{}", arg, i) } else { arg.clone() };
            client.go::<_, String>(&method, &arg, None)
        })
        .collect();

    let mut failures = 0;
    for call in calls {
        match call.done().await {
            Some(call) => match call.result {
                Ok(reply) => println!("[{}] {}", call.seq, reply),
                Err(e) => {
                    failures += 1;
                    println!("[{}] error: {}", call.seq, e);
                }
            },
            None => failures += 1,
        }
    }

    client.close().await?;

    if failures > 0 {
        anyhow::bail!("{} of {} calls failed", failures, count);
    }
    Ok(())
}
