use std::{path::Path, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use meshgate::{
    adapters::{GatewayServer, HealthChecker, HttpClientAdapter, middleware::default_registry},
    config::{GatewayConfig, GatewayConfigValidator, loader::load_config},
    core::{GatewayService, LoadBalancer, RouteManager, ServiceDiscovery, ServiceRegistry},
    metrics,
    ports::http_client::HttpClient,
    tracing_setup,
    utils::graceful_shutdown::{GracefulShutdown, ShutdownToken},
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "meshgate.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "meshgate.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "meshgate.yaml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "meshgate.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Init { config }) => ("init", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    match command {
        "validate" => return validate_config_command(&config_path).await,
        "init" => return init_config_command(&config_path).await,
        _ => {}
    }

    tracing_setup::init_tracing().map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    metrics::init_metrics();

    tracing::info!("Loading configuration from {config_path}");
    let config = load_config(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    if let Err(errors) = GatewayConfigValidator::validate(&config) {
        for error in &errors {
            tracing::error!("Configuration error: {}", error);
        }
        return Err(eyre!("Configuration validation failed with {} errors", errors.len()));
    }

    serve(config).await
}

async fn serve(config: GatewayConfig) -> Result<()> {
    let registry = Arc::new(
        ServiceRegistry::new(config.registry.clone())
            .with_health_path(config.health_check.default_path.clone()),
    );
    let discovery = Arc::new(ServiceDiscovery::new(
        registry.clone(),
        Duration::from_secs(config.discovery.ttl_secs),
    ));
    let balancer = Arc::new(LoadBalancer::new());
    let route_manager = Arc::new(RouteManager::new());
    let http_client: Arc<dyn HttpClient> = Arc::new(HttpClientAdapter::new());

    for entry in config.routes.clone() {
        let rule = entry.into_rule()?;
        route_manager
            .add_route(rule)
            .wrap_err("Failed to register configured route")?;
    }

    let gateway = Arc::new(GatewayService::new(
        route_manager.clone(),
        discovery,
        balancer,
        http_client.clone(),
        None,
        Arc::new(default_registry()),
    ));
    let server = GatewayServer::new(gateway, registry.clone());

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    // Background tasks: registry sweeper, health checker, limiter housekeeping.
    tokio::spawn(
        registry
            .clone()
            .run_sweeper(graceful_shutdown.shutdown_token()),
    );

    let health_checker = HealthChecker::new(
        registry.clone(),
        http_client,
        config.health_check.clone(),
    );
    let health_token = graceful_shutdown.shutdown_token();
    tokio::spawn(async move {
        health_checker.run(health_token).await;
    });

    tokio::spawn(run_limiter_housekeeping(
        route_manager,
        Duration::from_secs(config.rate_limiter.idle_key_ttl_secs),
        Duration::from_secs(config.rate_limiter.sweep_interval_secs),
        graceful_shutdown.shutdown_token(),
    ));

    tracing::info!("Starting Meshgate on {}", config.listen_addr);
    server
        .start(&config.listen_addr, graceful_shutdown.shutdown_token())
        .await?;

    tracing::info!("Meshgate shut down");
    Ok(())
}

async fn run_limiter_housekeeping(
    route_manager: Arc<RouteManager>,
    idle_ttl: Duration,
    interval: Duration,
    mut shutdown: ShutdownToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.wait_for_shutdown() => {
                tracing::info!("Rate limiter housekeeping shutting down");
                return;
            }
            _ = tokio::time::sleep(interval) => {
                route_manager.evict_idle_keys(idle_ttl);
            }
        }
    }
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("Error: configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            println!("Configuration validation: OK");
            println!();
            println!("Summary:");
            println!("   Listen address: {}", config.listen_addr);
            println!("   Routes: {}", config.routes.len());
            println!("   Health checks: {}", config.health_check.enabled);
            Ok(())
        }
        Err(errors) => {
            eprintln!("Configuration validation failed:");
            for error in errors {
                eprintln!("   {error}");
            }
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("Error: configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Meshgate configuration

listen_addr: "127.0.0.1:8080"

registry:
  sweep_interval_secs: 10
  liveness_window_secs: 30
  unhealthy_after_secs: 60
  deregister_after_secs: 300

health_check:
  enabled: true
  interval_secs: 30
  timeout_secs: 5
  default_path: "/health"

discovery:
  ttl_secs: 30

rate_limiter:
  idle_key_ttl_secs: 3600
  sweep_interval_secs: 60

routes:
  - id: "orders"
    pattern: "/orders/*"
    method: "GET"
    target_service: "orders"
    strategy: "round_robin"
    timeout_secs: 30
    retry_count: 1
    # rate_limit:
    #   requests_per_minute: 120
    #   requests_per_hour: 2000
    #   burst_size: 20
    # circuit_breaker:
    #   failure_threshold: 5
    #   recovery_timeout: 30
    #   half_open_max_calls: 2
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("Created default configuration at: {config_path}");
    println!("   Run 'meshgate serve --config {config_path}' to start the server");
    Ok(())
}
