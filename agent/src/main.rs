use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use confwatch::config::{self, Config, DEFAULT_LOG_LEVEL};
use confwatch::event::{AgentEvent, ChangeSink, Namespace, SourceKind};
use confwatch::queue::DeliveryQueue;
use confwatch::sources::{self, SourceContext, StateReporter};
use confwatch::status;
use confwatch::transport::{self, Transport};
use confwatch::paths;

/// How often queue length and last delivery are refreshed in `status.toml`.
const STATUS_REFRESH: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = paths::config_file_path();
    let loaded = config::load_or_default(&config_path);
    let log_level = match &loaded {
        Ok(c) => c.global.log_level.clone(),
        Err(_) => DEFAULT_LOG_LEVEL.to_string(),
    };
    init_logging(&log_level);

    let mut config = loaded.unwrap_or_else(|e| {
        tracing::error!("config error (using defaults): {e:#}");
        Config::default()
    });

    // ── Agent directory ───────────────────────────────────────────────────────
    let app_dir = paths::app_config_dir();
    if let Err(e) = std::fs::create_dir_all(&app_dir) {
        tracing::error!("failed to create agent directory {}: {e}", app_dir.display());
        std::process::exit(1);
    }

    // ── Server discovery ──────────────────────────────────────────────────────
    if let Some((host, port)) = paths::discover_server(Path::new(paths::VIRTIO_PORTS_DIR)) {
        config.delivery.server_url = format!("http://{host}:{port}");
        tracing::info!("admin server announced at {}", config.delivery.server_url);
    }

    // ── Initial status ────────────────────────────────────────────────────────
    let status_path = paths::status_file_path();
    let mut current_status = status::AgentStatus::new();
    status::write_status(&status_path, &current_status);

    // ── Delivery queue ────────────────────────────────────────────────────────
    let transport: Arc<dyn Transport> = Arc::from(transport::from_config(&config.delivery));
    let queue = DeliveryQueue::new(
        transport,
        Duration::from_millis(config.delivery.effective_retry_interval_ms()),
        tokio::runtime::Handle::current(),
    );
    let sink: Arc<dyn ChangeSink> = Arc::new(queue.clone());

    let (event_tx, mut event_rx) = mpsc::channel::<AgentEvent>(32);

    // ── Sources ───────────────────────────────────────────────────────────────
    start_sources(&config, &sink, &event_tx);

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(AgentEvent::Shutdown).await;
            }
        });
    }

    tracing::info!("confwatch-agent v{} started", env!("CARGO_PKG_VERSION"));

    // ── Event loop ────────────────────────────────────────────────────────────
    let mut refresh = tokio::time::interval(STATUS_REFRESH);
    loop {
        tokio::select! {
            Some(evt) = event_rx.recv() => match evt {
                AgentEvent::SourceState(kind, state) => {
                    current_status.set_source(kind, state);
                    current_status.queued = queue.len();
                    status::write_status(&status_path, &current_status);
                }
                AgentEvent::Shutdown => {
                    tracing::info!("shutting down");
                    queue.give_up();
                    current_status.queued = 0;
                    current_status.last_delivery = queue.last_delivery();
                    status::write_status(&status_path, &current_status);
                    break;
                }
            },
            _ = refresh.tick() => {
                let queued = queue.len();
                let last_delivery = queue.last_delivery();
                if queued != current_status.queued || last_delivery != current_status.last_delivery {
                    current_status.queued = queued;
                    current_status.last_delivery = last_delivery;
                    status::write_status(&status_path, &current_status);
                }
            }
        }
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Starts every enabled source on its own thread.
fn start_sources(config: &Config, sink: &Arc<dyn ChangeSink>, tx: &mpsc::Sender<AgentEvent>) {
    let policy_map = config
        .paths
        .policy_map
        .clone()
        .or_else(|| paths::find_policy_map(&paths::system_data_dirs()));

    for kind in SourceKind::ALL {
        if !config.sources.enabled(kind) {
            tracing::info!("{kind} source disabled");
            continue;
        }
        let ctx = SourceContext {
            sink: Arc::clone(sink),
            reporter: StateReporter::new(kind, tx.clone()),
        };
        let started = match kind {
            SourceKind::Settings => sources::spawn(kind, ctx, sources::settings::run),
            SourceKind::Network => sources::spawn(kind, ctx, sources::network::run),
            SourceKind::Chromium => {
                let dir = config.paths.chromium_dir.clone().unwrap_or_else(paths::chromium_dir);
                let map = policy_map.clone();
                sources::spawn(kind, ctx, move |ctx| {
                    sources::chromium::run(ctx, Namespace::ChromiumPolicies, dir, map)
                })
            }
            SourceKind::Chrome => {
                let dir = config.paths.chrome_dir.clone().unwrap_or_else(paths::chrome_dir);
                let map = policy_map.clone();
                sources::spawn(kind, ctx, move |ctx| {
                    sources::chromium::run(ctx, Namespace::ChromePolicies, dir, map)
                })
            }
            SourceKind::Firefox => {
                let dir = config.paths.firefox_dir.clone().unwrap_or_else(paths::firefox_dir);
                sources::spawn(kind, ctx, move |ctx| sources::firefox::run(ctx, dir))
            }
            SourceKind::FirefoxBookmarks => {
                let socket = config
                    .paths
                    .bookmark_socket
                    .clone()
                    .unwrap_or_else(paths::bookmark_socket_path);
                sources::spawn(kind, ctx, move |ctx| sources::firefox::run_bookmarks(ctx, socket))
            }
            SourceKind::OnlineAccounts => {
                let path = config
                    .paths
                    .goa_accounts
                    .clone()
                    .unwrap_or_else(paths::goa_accounts_path);
                sources::spawn(kind, ctx, move |ctx| sources::goa::run(ctx, path))
            }
        };
        if let Err(e) = started {
            tracing::error!("{e:#}");
        }
    }
}
