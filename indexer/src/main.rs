use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use pixelchain_indexer::{
    service, AllowancePolicy, Api, AppState, Canvas, CanvasIndexer, ChangeNotifier, Fanout,
    IndexerConfig, IndexerMetrics, MemoryCanvas, NotifyMetrics, RedisCanvas, SqlStore,
};
use pixelchain_types::CanvasConfig;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() -> Result<()> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        });

    if let Some(endpoint) = endpoint {
        let service_name = std::env::var("OTEL_SERVICE_NAME")
            .unwrap_or_else(|_| "pixelchain-indexer".to_string());
        let rate = std::env::var("OTEL_SAMPLING_RATE")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .context("failed to build OTLP exporter")?;
        let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(rate))
            .with_resource(
                opentelemetry_sdk::Resource::builder_empty()
                    .with_attributes([opentelemetry::KeyValue::new("service.name", service_name)])
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build();
        let tracer = tracer_provider.tracer("pixelchain-indexer");
        opentelemetry::global::set_tracer_provider(tracer_provider);

        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::INFO))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host interface to bind (default: localhost).
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// YAML file with width, height, color_bit_width and background_color.
    #[arg(long, conflicts_with_all = ["width", "height", "color_bit_width"])]
    canvas_config: Option<PathBuf>,

    /// Canvas width in pixels.
    #[arg(long, default_value_t = 256)]
    width: u32,

    /// Canvas height in pixels.
    #[arg(long, default_value_t = 256)]
    height: u32,

    /// Bits per color code.
    #[arg(long, default_value_t = 5)]
    color_bit_width: u8,

    /// Color of positions that were never placed.
    #[arg(long)]
    background_color: Option<u32>,

    /// Redis URL for the shared canvas bitmap (in-memory canvas when omitted).
    #[arg(long)]
    canvas_redis_url: Option<String>,

    /// Redis key holding the canvas bitmap.
    #[arg(long)]
    canvas_key: Option<String>,

    /// Path to SQLite database for the placement ledger (in-memory when omitted).
    #[arg(long)]
    ledger_path: Option<PathBuf>,

    /// Postgres connection string for the placement ledger (overrides SQLite path when set).
    #[arg(long)]
    ledger_url: Option<String>,

    /// Extra-pixel policy when a consumption exceeds the allowance: strict or permissive.
    #[arg(long)]
    allowance_policy: Option<String>,

    /// Max queued events awaiting the writer (0 uses default).
    #[arg(long)]
    event_buffer: Option<usize>,

    /// Period of the canvas reconcile sweep in milliseconds (0 disables).
    #[arg(long)]
    reconcile_interval_ms: Option<u64>,

    /// Max queued pixel updates in the broadcast channel (0 uses default).
    #[arg(long)]
    updates_broadcast_buffer: Option<usize>,

    /// Default history page size (0 uses default).
    #[arg(long)]
    history_default_limit: Option<usize>,

    /// Largest history page a client may request (0 disables limit).
    #[arg(long)]
    history_max_limit: Option<usize>,

    /// Max request body size in bytes (0 uses default).
    #[arg(long)]
    http_body_limit_bytes: Option<usize>,

    /// Redis URL for pixel update fanout (enables pubsub).
    #[arg(long)]
    fanout_redis_url: Option<String>,

    /// Redis channel for pixel update fanout.
    #[arg(long)]
    fanout_channel: Option<String>,

    /// Optional fanout origin identifier.
    #[arg(long)]
    fanout_origin: Option<String>,
}

/// Maps an optional arg value to Option: 0 => None, Some(v) => Some(v), None => default
fn map_optional_limit<T: Copy + PartialEq + From<u8>>(
    arg: Option<T>,
    default: Option<T>,
) -> Option<T> {
    match arg {
        Some(v) if v == T::from(0) => None,
        Some(v) => Some(v),
        None => default,
    }
}

/// Maps an optional arg value keeping default on 0: 0 => default, Some(v) => Some(v), None => default
fn map_optional_default_on_zero<T: Copy + PartialEq + From<u8>>(
    arg: Option<T>,
    default: Option<T>,
) -> Option<T> {
    match arg {
        Some(v) if v == T::from(0) => default,
        Some(v) => Some(v),
        None => default,
    }
}

fn build_config(args: &Args) -> Result<IndexerConfig> {
    let defaults = IndexerConfig::default();
    let allowance_policy = match args.allowance_policy.as_deref() {
        Some(value) => value
            .parse::<AllowancePolicy>()
            .map_err(|err| anyhow::anyhow!("invalid allowance policy: {err}"))?,
        None => defaults.allowance_policy,
    };
    Ok(IndexerConfig {
        allowance_policy,
        event_buffer: map_optional_default_on_zero(args.event_buffer, defaults.event_buffer),
        reconcile_interval_ms: map_optional_limit(
            args.reconcile_interval_ms,
            defaults.reconcile_interval_ms,
        ),
        updates_broadcast_buffer: map_optional_default_on_zero(
            args.updates_broadcast_buffer,
            defaults.updates_broadcast_buffer,
        ),
        history_default_limit: map_optional_default_on_zero(
            args.history_default_limit,
            defaults.history_default_limit,
        ),
        history_max_limit: map_optional_limit(args.history_max_limit, defaults.history_max_limit),
        http_body_limit_bytes: map_optional_default_on_zero(
            args.http_body_limit_bytes,
            defaults.http_body_limit_bytes,
        ),
        canvas_redis_url: args.canvas_redis_url.clone(),
        canvas_key: args.canvas_key.clone().or(defaults.canvas_key),
        ledger_path: args.ledger_path.clone(),
        ledger_url: args.ledger_url.clone(),
        fanout_redis_url: args.fanout_redis_url.clone(),
        fanout_channel: args.fanout_channel.clone().or(defaults.fanout_channel),
        fanout_origin: args.fanout_origin.clone(),
    })
}

fn load_canvas_config(path: &Path) -> Result<CanvasConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read canvas config {}", path.display()))?;
    serde_yaml::from_str(&raw)
        .with_context(|| format!("invalid canvas config {}", path.display()))
}

fn build_canvas_config(args: &Args) -> Result<CanvasConfig> {
    let config = match &args.canvas_config {
        Some(path) => load_canvas_config(path)?,
        None => CanvasConfig::new(args.width, args.height, args.color_bit_width)
            .context("invalid canvas dimensions")?,
    };
    match args.background_color {
        Some(color) => config
            .with_background(color)
            .context("invalid background color"),
        None => Ok(config),
    }
}

async fn open_canvas(config: &IndexerConfig, canvas_config: CanvasConfig) -> Result<Canvas> {
    let Some(url) = &config.canvas_redis_url else {
        info!("Using in-memory canvas");
        return Ok(Canvas::Memory(MemoryCanvas::new(&canvas_config)));
    };
    let canvas = RedisCanvas::new(url, config.canvas_key().to_string(), canvas_config)
        .context("invalid canvas redis url")?;
    let created = canvas
        .initialize()
        .await
        .context("initialize redis canvas")?;
    info!(key = canvas.key(), created, "Redis canvas enabled");
    Ok(Canvas::Redis(canvas))
}

async fn open_ledger(config: &IndexerConfig) -> Result<SqlStore> {
    if let Some(url) = &config.ledger_url {
        let store = SqlStore::connect_postgres(url)
            .await
            .context("connect postgres ledger")?;
        info!("Postgres ledger enabled");
        return Ok(store);
    }
    if let Some(path) = &config.ledger_path {
        let store = SqlStore::open_sqlite(path).context("open sqlite ledger")?;
        info!(path = %path.display(), "SQLite ledger enabled");
        return Ok(store);
    }
    info!("Using in-memory ledger");
    SqlStore::open_in_memory().context("open in-memory ledger")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let args = Args::parse();
    let config = build_config(&args)?;
    let canvas_config = build_canvas_config(&args)?;
    info!(
        width = canvas_config.width(),
        height = canvas_config.height(),
        bits = canvas_config.color_bit_width(),
        policy = ?config.allowance_policy,
        "Canvas indexer starting"
    );

    let canvas = Arc::new(open_canvas(&config, canvas_config).await?);
    let store = Arc::new(open_ledger(&config).await?);

    let indexer_metrics = Arc::new(IndexerMetrics::default());
    let notify_metrics = Arc::new(NotifyMetrics::default());
    let (updates, _) = broadcast::channel(config.updates_broadcast_capacity());
    let fanout = match &config.fanout_redis_url {
        Some(url) => {
            let fanout = Arc::new(
                Fanout::new(
                    url,
                    config.fanout_channel().to_string(),
                    config.fanout_origin.clone(),
                    Arc::clone(&notify_metrics),
                )
                .context("invalid fanout redis url")?,
            );
            fanout.start(updates.clone());
            info!(
                channel = fanout.channel(),
                origin = fanout.origin(),
                "Pixel fanout enabled"
            );
            Some(fanout)
        }
        None => None,
    };
    let notifier = ChangeNotifier::new(updates, fanout);

    let indexer = CanvasIndexer::new(
        canvas_config,
        Arc::clone(&canvas),
        Arc::clone(&store),
        notifier.clone(),
    )
    .with_policy(config.allowance_policy)
    .with_metrics(Arc::clone(&indexer_metrics));
    let (handle, writer) = service::spawn(
        indexer,
        config.event_buffer_capacity(),
        config.reconcile_interval(),
    );

    let state = Arc::new(AppState {
        canvas_config,
        config,
        canvas,
        store,
        handle,
        notifier,
        indexer_metrics,
        notify_metrics,
    });
    let app = Api::new(state).router();

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server error")?;

    writer.await.context("indexer service task failed")?;
    Ok(())
}
