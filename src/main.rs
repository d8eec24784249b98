use std::path::PathBuf;
use std::sync::Arc;

use anvil_core::config::{self, AnvilConfig, StorageKind};
use anvil_core::protocol::{self, DAEMON_SOCKET_PATH, DaemonRequest, DaemonResponse};
use anvil_core::store::{MemStore, Store};
use anvil_runtime::{ContainerService, InstanceManager};
use anvil_runtime::vm::service::VmService;
use anvil_security::{AbuseTracker, RateLimitScope, RateLimiter};
use anvil_storage::{LocalBackend, ObjectStoreBackend, StaleSessionJanitor, StorageBackend};
use anvil_supervisor::Supervisor;
use anvil_wireguard::WireguardManager;
use anvil_wireguard::kernel::{SystemRunner, WgInterface};
use anvild::dispatch::AppState;
use anvild::identity;
use anvild::observability::{logging, metrics};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "anvild", about = "Boot-to-root CTF lab provisioning daemon")]
struct Cli {
    /// Path to the daemon's TOML config file.
    #[arg(long, default_value = "/etc/anvil/anvild.toml")]
    config: PathBuf,

    /// Path to the Unix control socket to listen on.
    #[arg(long, default_value = DAEMON_SOCKET_PATH)]
    socket: String,

    /// Emit structured JSON logs instead of human-readable ones.
    #[arg(long)]
    json_logs: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(if cli.json_logs {
        logging::LogFormat::Json
    } else {
        logging::LogFormat::Human
    });

    let config = match config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(error = %e, path = %cli.config.display(), "failed to load config, using defaults");
            AnvilConfig::default()
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(run(config, cli.socket))
}

async fn run(config: AnvilConfig, socket_path: String) -> Result<()> {
    let store = Arc::new(MemStore::new());

    match config.storage.kind {
        StorageKind::Local => {
            let backend = Arc::new(LocalBackend::new(PathBuf::from(&config.storage.root)));
            run_with_backend(config, socket_path, store, backend).await
        }
        StorageKind::ObjectStore => {
            let bucket = config
                .storage
                .s3_bucket
                .clone()
                .context("storage.s3_bucket is required for the object_store backend")?;
            let mut builder = opendal::services::S3::default()
                .bucket(&bucket)
                .root(&config.storage.root);
            if let Some(endpoint) = &config.storage.s3_endpoint {
                builder = builder.endpoint(endpoint);
            }
            if let Some(region) = &config.storage.s3_region {
                builder = builder.region(region);
            }
            let op = opendal::Operator::new(builder)
                .context("failed to construct object-store operator")?
                .finish();
            let backend = Arc::new(ObjectStoreBackend::new(op));
            run_with_backend(config, socket_path, store, backend).await
        }
    }
}

/// Generic over the storage backend so both the local-disk and
/// object-store configurations wire the same service graph without
/// dynamic dispatch across `UploadEngine`/`Supervisor`'s generic params.
async fn run_with_backend<B: StorageBackend + 'static>(
    config: AnvilConfig,
    socket_path: String,
    store: Arc<MemStore>,
    backend: Arc<B>,
) -> Result<()> {
    let identity = identity::load_or_generate(&config.wireguard.state_dir)
        .context("failed to load or generate wireguard server identity")?;

    let docker = bollard::Docker::connect_with_local_defaults()
        .context("failed to connect to Docker daemon")?;
    let container_service = Arc::new(ContainerService::new(docker, config.container.clone()));

    let vm_service = Arc::new(VmService::new(
        store.clone(),
        config.quotas,
        "/var/lib/anvil/overlays",
    ));

    let instance_manager = Arc::new(InstanceManager::new(
        store.clone(),
        config.quotas,
        container_service.clone(),
        vm_service.clone(),
    ));

    let upload_engine = Arc::new(anvil_upload::UploadEngine::new(
        store.clone(),
        backend.clone(),
        config.upload.clone(),
    ));
    let upload_janitor = Arc::new(StaleSessionJanitor::new(store.clone(), backend));

    let iface = WgInterface::new(config.wireguard.interface.clone(), SystemRunner);
    let wireguard = Arc::new(
        WireguardManager::new(
            store.clone(),
            iface,
            config.wireguard.clone(),
            identity.public_key,
            identity.encryption_key,
        )
        .context("failed to initialize wireguard manager")?,
    );

    let rate_limit_cfg = config.rate_limit;
    let mut rate_limiters = std::collections::HashMap::new();
    rate_limiters.insert(
        RateLimitScope::GlobalIp,
        Arc::new(RateLimiter::new(
            RateLimitScope::GlobalIp,
            rate_limit_cfg.global_rate_per_window,
            rate_limit_cfg.global_window_secs,
            rate_limit_cfg.global_burst,
        )),
    );
    rate_limiters.insert(
        RateLimitScope::InstanceStart,
        Arc::new(RateLimiter::new(
            RateLimitScope::InstanceStart,
            rate_limit_cfg.global_rate_per_window,
            rate_limit_cfg.global_window_secs,
            rate_limit_cfg.global_burst,
        )),
    );
    rate_limiters.insert(
        RateLimitScope::VpnConfigGenerate,
        Arc::new(RateLimiter::new(
            RateLimitScope::VpnConfigGenerate,
            rate_limit_cfg.global_rate_per_window,
            rate_limit_cfg.global_window_secs,
            rate_limit_cfg.global_burst,
        )),
    );
    let abuse_tracker = Arc::new(AbuseTracker::new(
        rate_limit_cfg.abuse_threshold,
        rate_limit_cfg.abuse_window_secs,
        rate_limit_cfg.abuse_window_secs,
    ));

    let supervisor = Arc::new(Supervisor::new(
        store.clone(),
        config.supervisor,
        config.container.cleanup_interval_secs,
        instance_manager.clone(),
        vm_service.clone(),
        container_service.clone(),
        upload_janitor,
        rate_limiters.values().cloned().collect(),
        abuse_tracker,
    ));

    let shutdown = CancellationToken::new();
    let supervisor_handles = supervisor.run(shutdown.clone()).await;

    let app_state = Arc::new(AppState {
        store,
        instance_manager,
        upload_engine,
        wireguard,
        rate_limiters,
    });

    let accept_handle = spawn_accept_loop(app_state, socket_path.clone(), shutdown.clone())?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown signal received, stopping anvild");
    shutdown.cancel();

    let _ = accept_handle.await;
    for handle in supervisor_handles {
        let _ = handle.await;
    }

    info!("anvild stopped");
    Ok(())
}

fn spawn_accept_loop<S: Store + 'static, B: StorageBackend + 'static>(
    state: Arc<AppState<S, B>>,
    socket_path: String,
    shutdown: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    if std::path::Path::new(&socket_path).exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("failed to remove stale socket at {socket_path}"))?;
    }
    if let Some(parent) = std::path::Path::new(&socket_path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create socket directory {}", parent.display()))?;
    }

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind control socket at {socket_path}"))?;
    info!(socket = %socket_path, "anvild listening");

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            metrics::global().connections_accepted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            let state = state.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, state).await {
                                    warn!(error = %e, "connection handler error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept error"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("control socket listener shutting down");
                    break;
                }
            }
        }
        let _ = std::fs::remove_file(&socket_path);
    }))
}

async fn handle_connection<S: Store + 'static, B: StorageBackend + 'static>(
    mut stream: tokio::net::UnixStream,
    state: Arc<AppState<S, B>>,
) -> Result<()> {
    loop {
        let req: DaemonRequest = match protocol::recv_request(&mut stream).await {
            Ok(req) => req,
            Err(_) => return Ok(()),
        };
        let response: DaemonResponse = state.dispatch(req).await;
        protocol::send_response(&mut stream, &response).await?;
    }
}
