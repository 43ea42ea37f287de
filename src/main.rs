#![warn(
    rust_2024_compatibility,
    clippy::all,
    clippy::future_not_send,
    clippy::mod_module_files,
    clippy::needless_pass_by_ref_mut,
    clippy::unused_async
)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
use rama::{
    Layer as RamaLayer,
    graceful::Shutdown,
    http::{layer::trace::TraceLayer, server::HttpServer},
    layer::ConsumeErrLayer,
    rt::Executor,
    tcp::server::TcpListener,
};
use tracing_subscriber::{
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use caproxy::{
    config::{Config, DEFAULT_CONFIG_FILE},
    credentials::CredentialCache,
    directory::{CodeArtifactDirectory, RegistryDirectory, derive_endpoint},
    proxy::{CaProxy, FrontDoor},
    refresh,
    routing::RoutingTable,
    secrets::{SecretStore, SecretsManagerStore},
    upstream::UpstreamClient,
};

#[derive(Debug, Parser)]
#[command(author, version, about = "CodeArtifact reverse proxy for package managers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the proxy server
    Serve {
        /// Path to the configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
    /// Validate the configuration and print the host routing map
    Check {
        /// Path to the configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
    /// Run one credential refresh and print the resolved backend endpoints
    Resolve {
        /// Path to the configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
    /// Perform a health check against a running instance
    Health {
        /// URL of the health endpoint (defaults to local proxy)
        #[arg(long, default_value = "http://127.0.0.1:5000/health")]
        url: String,
        /// Timeout in seconds for the request
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => run_server(config),
        Command::Check { config } => run_check(config),
        Command::Resolve { config } => run_resolve(config),
        Command::Health { url, timeout } => run_health(url, timeout),
    }
}

fn load_config(config_path: PathBuf) -> Result<Config> {
    let config = Config::load(Some(config_path)).context("loading configuration")?;
    config.validate().context("validating configuration")?;
    Ok(config)
}

fn run_server(config_path: PathBuf) -> Result<()> {
    let config = load_config(config_path)?;
    init_tracing(&config)?;

    let routes = Arc::new(
        RoutingTable::from_config(&config.repositories).context("building routing table")?,
    );
    tracing::info!(
        repositories = routes.descriptors().len(),
        hosts = routes.len(),
        "routing table built"
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("constructing setup runtime")?;
    let front_door = rt
        .block_on(resolve_front_door(&config))
        .context("resolving front-door credentials")?;
    drop(rt);

    let cache = Arc::new(CredentialCache::new(
        routes.clone(),
        config.registry.token_duration(),
    ));
    let registry = config.registry.clone();
    refresh::spawn_refresh_thread(cache.clone(), config.refresh.interval(), move || async move {
        Arc::new(CodeArtifactDirectory::new(&registry).await) as Arc<dyn RegistryDirectory>
    })
    .context("acquiring initial backend credentials")?;

    let transport = Arc::new(UpstreamClient::new(config.upstream.timeout()));
    let proxy = CaProxy::new(&config, routes, cache, transport, front_door);

    let rt_server = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.workers)
        .enable_all()
        .build()
        .context("constructing server runtime")?;

    rt_server.block_on(async move {
        let graceful = Shutdown::default();
        let addr = format!("{}:{}", config.server.host, config.server.port);

        let tcp_service = TcpListener::build()
            .bind(addr.clone())
            .await
            .map_err(|err| anyhow!("binding {addr}: {err}"))?;

        tracing::info!(%addr, "starting Rama HTTP server");

        graceful.spawn_task_fn(move |guard| {
            let proxy = proxy.clone();
            async move {
                let exec = Executor::graceful(guard.clone());
                let http_service = HttpServer::auto(exec).service(
                    (TraceLayer::new_for_http(), ConsumeErrLayer::default()).into_layer(proxy),
                );

                tcp_service.serve_graceful(guard, http_service).await;
            }
        });

        // Wait for ctrl+c to initiate graceful shutdown
        tokio::signal::ctrl_c()
            .await
            .context("listening for shutdown signal")?;

        graceful
            .shutdown_with_limit(Duration::from_secs(30))
            .await?;

        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

async fn resolve_front_door(config: &Config) -> Result<FrontDoor> {
    if let Some(secret_id) = config.auth.secret_id.as_deref() {
        let store = SecretsManagerStore::new(&config.registry.region).await;
        let credentials = store
            .fetch(secret_id)
            .await
            .with_context(|| format!("fetching front-door secret {secret_id}"))?;
        return Ok(FrontDoor::Basic(credentials));
    }

    let front_door = FrontDoor::from_static(&config.auth);
    if front_door.is_anonymous() {
        tracing::warn!("no front-door credentials configured, allowing anonymous access");
    }
    Ok(front_door)
}

fn run_check(config_path: PathBuf) -> Result<()> {
    let config = load_config(config_path)?;
    let routes =
        RoutingTable::from_config(&config.repositories).context("building routing table")?;

    let mut hosts: Vec<_> = routes.hosts().collect();
    hosts.sort_by_key(|(host, _)| *host);

    println!(
        "Configuration OK: {} repositories, {} hosts",
        routes.descriptors().len(),
        routes.len()
    );
    for (host, descriptor) in hosts {
        println!(
            "  {host} -> {}/{} ({})",
            descriptor.domain, descriptor.repository, descriptor.format
        );
        println!(
            "      expected endpoint: {}",
            derive_endpoint(
                &descriptor.domain,
                &config.registry.account_id,
                &config.registry.region,
                &descriptor.format,
                &descriptor.repository,
            )
        );
    }
    Ok(())
}

fn run_resolve(config_path: PathBuf) -> Result<()> {
    let config = load_config(config_path)?;
    init_tracing(&config)?;

    let routes = Arc::new(
        RoutingTable::from_config(&config.repositories).context("building routing table")?,
    );
    let cache = CredentialCache::new(routes.clone(), config.registry.token_duration());

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("constructing resolve runtime")?;
    let summary = rt
        .block_on(async {
            let directory = CodeArtifactDirectory::new(&config.registry).await;
            cache.refresh(&directory).await
        })
        .context("refreshing backend credentials")?;
    drop(rt);

    println!(
        "Resolved {} domains and {} hosts",
        summary.domains, summary.hosts
    );
    for domain in routes.domains() {
        let issued = cache.get_token(domain).is_some();
        println!(
            "  domain {domain}: token {}",
            if issued { "issued (redacted)" } else { "missing" }
        );
    }

    let mut hosts: Vec<_> = routes.hosts().map(|(host, _)| host).collect();
    hosts.sort_unstable();
    for host in hosts {
        match cache.get_base_url(host) {
            Some(target) => println!("  {host} -> {target}"),
            None => println!("  {host} -> (unresolved)"),
        }
    }
    Ok(())
}

fn run_health(url: String, timeout: u64) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout))
        .build()
        .context("building health check client")?;

    let response = client
        .get(&url)
        .send()
        .context("sending health check request")?;

    let status = response.status();
    if !status.is_success() {
        bail!("health endpoint returned status {status}");
    }

    let body: serde_json::Value = response.json().context("parsing health response")?;
    match body.get("status").and_then(|s| s.as_str()) {
        Some("ok") => {
            println!("caproxy healthy: {status}");
            Ok(())
        }
        Some(other) => bail!("caproxy reports {other}: {body}"),
        None => bail!("unexpected health response: {body}"),
    }
}

fn init_tracing(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.logging.level))
        .context("building log filter")?;

    let fmt_layer = if config.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        use opentelemetry_otlp::WithExportConfig;

        let resource = Resource::builder_empty()
            .with_attributes([
                KeyValue::new("service.name", "caproxy"),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ])
            .build();

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()?;

        let provider = sdktrace::SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build();

        let tracer = provider.tracer("caproxy");
        global::set_tracer_provider(provider);

        registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
    } else {
        registry.try_init()?;
    }
    Ok(())
}
