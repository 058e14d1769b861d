//! iot-ubusd - bus objects backed by Lua scripts or a remote MQTT peer
//!
//! Subcommands:
//! - `ubusd serve` (default) - register objects and serve the bus
//! - `ubusd call <object> <method> [json]` - call a method on a running daemon
//! - `ubusd list` - show registered objects and method signatures

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use ubusconf::{expand_path, BackendMode, UbusdConfig};
use ubusproto::{BusClient, ClientConfig};

use ubusd::broker::{BrokerManager, BrokerSettings, MqttConnector};
use ubusd::telemetry;
use ubusd::{
    load_objects, Dispatcher, Mailbox, Registry, RemoteBridge, ScriptBackend, ScriptConfig,
    Server, ServerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "ubusd")]
#[command(about = "Bus objects backed by Lua scripts or a remote MQTT peer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Objects document (JSON)
    #[arg(short = 'c', long = "objects", global = true)]
    objects: Option<String>,

    /// Log level: 0=off, 1=error, 2=info, 3=debug, 4=trace
    #[arg(short = 'v', long = "verbose", value_name = "LEVEL", global = true)]
    verbose: Option<u8>,

    /// Config file replacing ./iot-ubusd.toml
    #[arg(long, global = true)]
    config_file: Option<PathBuf>,

    /// Bus endpoint (e.g., tcp://127.0.0.1:5590)
    #[arg(long, global = true)]
    bus: Option<String>,

    /// MQTT broker address (e.g., mqtt://127.0.0.1:1883)
    #[arg(long, global = true)]
    mqtt: Option<String>,

    /// MQTT keepalive in seconds (0 disables)
    #[arg(long, global = true)]
    keepalive: Option<u64>,

    /// Lua file serving object calls
    #[arg(long, global = true)]
    callback_script: Option<String>,

    /// Lua file serving iot-ubusd iot-rpc
    #[arg(long, global = true)]
    rpc_script: Option<String>,

    /// Backend for object calls: script or remote
    #[arg(long, global = true)]
    backend: Option<BackendMode>,

    /// Module name in the remote call envelope
    #[arg(long, global = true)]
    remote_module: Option<String>,

    /// Function name in the remote call envelope
    #[arg(long, global = true)]
    remote_function: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register objects and serve the bus (default)
    Serve,

    /// Call a method on a running daemon
    Call {
        object: String,
        method: String,

        /// JSON params
        #[arg(default_value = "{}")]
        json: String,

        /// Timeout in milliseconds
        #[arg(short, long, default_value = "15000")]
        timeout: u64,
    },

    /// List registered objects and method signatures
    List {
        /// Timeout in milliseconds
        #[arg(short, long, default_value = "5000")]
        timeout: u64,
    },
}

impl Cli {
    /// Command-line flags win over files and environment.
    fn apply(&self, config: &mut UbusdConfig) {
        if let Some(path) = &self.objects {
            config.paths.objects_file = expand_path(path);
        }
        if let Some(path) = &self.callback_script {
            config.paths.callback_script = expand_path(path);
        }
        if let Some(path) = &self.rpc_script {
            config.paths.rpc_script = expand_path(path);
        }
        if let Some(endpoint) = &self.bus {
            config.bus.endpoint = endpoint.clone();
        }
        if let Some(address) = &self.mqtt {
            config.broker.address = address.clone();
        }
        if let Some(secs) = self.keepalive {
            config.broker.keepalive_secs = secs;
        }
        if let Some(mode) = self.backend {
            config.backend.mode = mode;
        }
        if let Some(module) = &self.remote_module {
            config.backend.remote_module = module.clone();
        }
        if let Some(function) = &self.remote_function {
            config.backend.remote_function = function.clone();
        }
        config.normalize();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        UbusdConfig::load_from(cli.config_file.as_deref()).context("Failed to load config")?;
    cli.apply(&mut config);

    let filter = match cli.verbose {
        Some(level) => telemetry::verbosity_filter(level).to_string(),
        None => config.telemetry.log_level.clone(),
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let mut otel = telemetry::init(&filter, config.telemetry.otlp())
                .context("Failed to initialize telemetry")?;
            let result = serve(config).await;
            info!("flushing telemetry");
            otel.shutdown();
            result?;
        }
        Commands::Call {
            object,
            method,
            json,
            timeout,
        } => {
            let _otel = telemetry::init(&filter, None)?;
            call(&config, &object, &method, &json, timeout).await?;
        }
        Commands::List { timeout } => {
            let _otel = telemetry::init(&filter, None)?;
            list(&config, timeout).await?;
        }
    }

    Ok(())
}

async fn serve(config: UbusdConfig) -> Result<()> {
    info!("iot-ubusd starting");
    info!("   Bus: {}", config.bus.endpoint);
    info!("   Objects: {}", config.paths.objects_file.display());
    info!("   Backend: {}", config.backend.mode);

    let schemas = match load_objects(&config.paths.objects_file) {
        Ok(parsed) => parsed.objects,
        Err(e) => {
            error!("{}", e);
            Vec::new()
        }
    };
    let registry = Arc::new(Registry::build(schemas, config.backend.mode));

    let cancel = CancellationToken::new();
    let script = ScriptBackend::new(ScriptConfig::from_config(&config));

    let mut broker_status = None;
    let mut broker_task = None;
    let remote = match config.backend.mode {
        BackendMode::Script => None,
        BackendMode::Remote => {
            let mailbox = Arc::new(Mailbox::new(
                Duration::from_millis(config.backend.call_timeout_ms),
                cancel.clone(),
            ));

            match MqttConnector::new(&config.broker.address) {
                Ok(connector) => {
                    info!("   Broker: {}", config.broker.address);
                    let manager = BrokerManager::new(
                        Box::new(connector),
                        BrokerSettings::from_config(&config.broker),
                        Arc::clone(&mailbox),
                        cancel.clone(),
                    );
                    broker_status = Some(manager.status());
                    broker_task = Some(tokio::spawn(manager.run()));
                }
                Err(e) => error!("broker disabled: {}", e),
            }

            Some(RemoteBridge::new(
                mailbox,
                config.backend.remote_module.clone(),
                config.backend.remote_function.clone(),
            ))
        }
    };

    let dispatcher = Arc::new(Dispatcher::new(script, remote));

    spawn_signal_handler(cancel.clone());

    let server_config = ServerConfig {
        endpoint: config.bus.endpoint.clone(),
        ..ServerConfig::default()
    };
    let mut server = Server::new(server_config, registry, dispatcher);
    if let Some(status) = broker_status {
        server = server.with_broker_status(status);
    }

    let result = server.run(cancel.clone()).await;

    cancel.cancel();
    if let Some(task) = broker_task {
        if let Err(e) = task.await {
            warn!("broker task ended abnormally: {}", e);
        }
    }

    info!("Shutdown complete");
    result
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
            }
            _ = terminate() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

async fn connect(config: &UbusdConfig, timeout_ms: u64) -> Result<BusClient> {
    let client_config =
        ClientConfig::new("ubusd-cli", &config.bus.endpoint).with_timeout(Duration::from_millis(timeout_ms));
    BusClient::connect(client_config)
        .await
        .with_context(|| format!("Failed to connect to {}", config.bus.endpoint))
}

async fn call(config: &UbusdConfig, object: &str, method: &str, json: &str, timeout_ms: u64) -> Result<()> {
    let params: serde_json::Value =
        serde_json::from_str(json).with_context(|| format!("Invalid JSON params: {}", json))?;

    let client = connect(config, timeout_ms).await?;
    let reply = client.call(object, method, params).await?;
    client.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&reply.data)?);
    if !reply.is_ok() {
        warn!("{}.{} returned status {}", object, method, reply.status);
    }
    Ok(())
}

async fn list(config: &UbusdConfig, timeout_ms: u64) -> Result<()> {
    let client = connect(config, timeout_ms).await?;
    let catalog = client.list().await?;
    client.shutdown().await;

    println!("backend: {}", catalog.backend);
    if let Some(broker) = &catalog.broker {
        println!("broker: {}", broker);
    }
    for object in &catalog.objects {
        println!("'{}'", object.name);
        for method in &object.methods {
            let params: Vec<String> = method
                .params
                .iter()
                .map(|p| format!("\"{}\":\"{}\"", p.name, p.kind.as_str()))
                .collect();
            println!("\t\"{}\":{{{}}}", method.name, params.join(","));
        }
    }
    Ok(())
}
