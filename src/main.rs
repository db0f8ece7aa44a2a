use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

use edgebot::breaker::Breaker;
use edgebot::cli::{exit_code, Cli};
use edgebot::config::{self, Config, SinkConfig};
use edgebot::envelope;
use edgebot::health;
use edgebot::listener::{self, EnqueueHandle, Listener};
use edgebot::metrics::Metrics;
use edgebot::rate_limiter::RateLimiter;
use edgebot::shipper::{Shipper, SinkHandle};
use edgebot::sinks::{file::FileSink, http::HttpSink, Sink};
use edgebot::spool::{memory::MemorySpool, sqlite::SqliteSpool, Spool};
use edgebot::supervisor::Supervisor;

fn main() {
    let cli = Cli::parse();
    let code = run(cli);
    std::process::exit(code);
}

/// Reinstallable handle onto the active `EnvFilter`, used to apply a reloaded
/// log level on SIGHUP without rebuilding the whole subscriber (§4.8).
type LogReloadHandle = tracing_subscriber::reload::Handle<EnvFilter, tracing_subscriber::Registry>;

fn run(cli: Cli) -> i32 {
    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return exit_code::CONFIG_ERROR;
        }
    };

    let log_reload = init_logging(&config.log);

    if cli.dry_run {
        match build_dry_run(&config) {
            Ok(()) => {
                info!("dry run ok");
                return exit_code::OK;
            }
            Err(e) => {
                error!(error = %e, "dry run failed");
                return exit_code::CONFIG_ERROR;
            }
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return exit_code::FATAL;
        }
    };

    match runtime.block_on(run_async(cli.config, config, log_reload)) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal error");
            exit_code::FATAL
        }
    }
}

fn init_logging(log_cfg: &config::LogConfig) -> LogReloadHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_cfg.level.as_str()));
    let (filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);
    let subscriber = tracing_subscriber::registry().with(filter);
    match log_cfg.format {
        config::LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer().json();
            tracing_subscriber::util::SubscriberInitExt::init(subscriber.with(layer));
        }
        config::LogFormat::Text => {
            let layer = tracing_subscriber::fmt::layer();
            tracing_subscriber::util::SubscriberInitExt::init(subscriber.with(layer));
        }
    }
    reload_handle
}

fn build_dry_run(config: &Config) -> anyhow::Result<()> {
    match &config.output.primary {
        SinkConfig::Http { url, .. } => {
            url.parse::<reqwest::Url>().context("output.primary.url is not a valid URL")?;
        }
        SinkConfig::File { url, .. } => {
            FileSink::new(url, true).map_err(|e| anyhow::anyhow!(e))?;
        }
    }
    Ok(())
}

async fn run_async(
    config_path: std::path::PathBuf,
    mut config: Config,
    log_reload: LogReloadHandle,
) -> anyhow::Result<i32> {
    let metrics = Arc::new(Metrics::new());
    metrics.set_up(true);

    let spool: Arc<dyn Spool> = if config.buffer.disk_buffer {
        Arc::new(
            SqliteSpool::open(&config.state_dir, config.buffer.disk_buffer_max_size.0)
                .await
                .map_err(|e| anyhow::anyhow!(e))?,
        )
    } else {
        Arc::new(MemorySpool::new(config.buffer.disk_buffer_max_size.0))
    };

    spool.reap_stale().await.map_err(|e| anyhow::anyhow!(e))?;

    let sink_handle = build_sink_handle(&config)?;
    let node_source = default_node_identity();

    let wake = Arc::new(Notify::new());
    let shipper = Arc::new(Shipper::new(
        spool.clone(),
        vec![sink_handle],
        config.batching.clone(),
        node_source,
        metrics.clone(),
        wake.clone(),
    ));

    let mut supervisor = Supervisor::new(config.supervisor.clone());

    {
        let shipper = shipper.clone();
        supervisor.register(
            "shipper",
            Arc::new(move |shutdown_rx| {
                let shipper = shipper.clone();
                Box::pin(async move {
                    shipper.run(shutdown_rx).await;
                    Ok(())
                })
            }),
        );
    }

    let clock_skew_bound = envelope::DEFAULT_CLOCK_SKEW_BOUND;
    let enqueue_handle = Arc::new(EnqueueHandle::new(
        spool.clone(),
        metrics.clone(),
        clock_skew_bound,
        config.buffer.max_size,
    ));

    register_listeners(&mut supervisor, &config, enqueue_handle.clone(), wake.clone(), metrics.clone());

    let supervisor = Arc::new(supervisor);
    let handles = supervisor.spawn_all();

    let app_state = Arc::new(health::AppState {
        supervisor: supervisor.clone(),
        metrics: metrics.clone(),
        shutting_down: std::sync::atomic::AtomicBool::new(false),
    });
    let addr = SocketAddr::new(config.server.host, config.server.port);
    let health_task = tokio::spawn(health::serve(addr, app_state.clone()));
    let metrics_poll_task = tokio::spawn(poll_gauges(spool.clone(), supervisor.clone(), metrics.clone()));

    let exit_via_sigint = run_signal_loop(&config_path, &mut config, &shipper, &log_reload).await;

    info!("shutdown signal received, draining");
    app_state.shutting_down.store(true, std::sync::atomic::Ordering::Relaxed);
    supervisor.signal_shutdown();

    let grace = supervisor.shutdown_grace().await;
    for handle in handles {
        let _ = tokio::time::timeout(grace, handle).await;
    }
    health_task.abort();
    metrics_poll_task.abort();

    if exit_via_sigint {
        Ok(exit_code::SIGINT)
    } else {
        Ok(exit_code::OK)
    }
}

/// Waits for a terminal shutdown signal, reloading config in place on every
/// SIGHUP along the way (§4.8). Returns `true` if shutdown was triggered by
/// SIGINT specifically (§6.3: exit 130).
#[cfg(unix)]
async fn run_signal_loop(
    config_path: &std::path::Path,
    config: &mut Config,
    shipper: &Shipper,
    log_reload: &LogReloadHandle,
) -> bool {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sighup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
    loop {
        tokio::select! {
            _ = sigterm.recv() => return false,
            _ = sigint.recv() => return true,
            _ = sighup.recv() => reload_on_sighup(config_path, config, shipper, log_reload),
        }
    }
}

#[cfg(not(unix))]
async fn run_signal_loop(
    _config_path: &std::path::Path,
    _config: &mut Config,
    _shipper: &Shipper,
    _log_reload: &LogReloadHandle,
) -> bool {
    let _ = tokio::signal::ctrl_c().await;
    true
}

/// Re-reads the config file and applies only the fields marked safe to
/// reload in `Config::apply_reloadable`: rate limit values, batch sizes, and
/// log level. Listener endpoints and ports are never touched.
fn reload_on_sighup(config_path: &std::path::Path, config: &mut Config, shipper: &Shipper, log_reload: &LogReloadHandle) {
    info!("SIGHUP received, reloading config");
    let fresh = match Config::load(config_path) {
        Ok(fresh) => fresh,
        Err(e) => {
            error!(error = %e, "SIGHUP reload failed, keeping previous config");
            return;
        }
    };

    config.apply_reloadable(&fresh);
    shipper.reload_batching(config.batching.clone());
    shipper.reload_rate_limit(&config.rate_limit);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log.level.as_str()));
    if let Err(e) = log_reload.reload(filter) {
        error!(error = %e, "failed to reinstall log filter after SIGHUP");
    }

    info!("config reloaded");
}

/// File sink writes have no network timeout concept; this is used only to
/// size the claim lease for the local-disk sink (§4.1).
const FILE_SINK_LEASE_TIMEOUT_MS: u64 = 10_000;

fn build_sink_handle(config: &Config) -> anyhow::Result<SinkHandle> {
    let (sink, timeout_ms): (Arc<dyn Sink>, u64) = match &config.output.primary {
        SinkConfig::Http { url, auth_token, tls, compression, timeout_ms } => (
            Arc::new(
                HttpSink::new(url.clone(), auth_token.clone(), tls, *compression, *timeout_ms)
                    .map_err(|e| anyhow::anyhow!(e))?,
            ),
            *timeout_ms,
        ),
        SinkConfig::File { url, compression } => (
            Arc::new(FileSink::new(url, *compression).map_err(|e| anyhow::anyhow!(e))?),
            FILE_SINK_LEASE_TIMEOUT_MS,
        ),
    };

    let breaker = Breaker::new(
        config.breaker.failure_threshold,
        std::time::Duration::from_secs(config.breaker.open_duration_sec),
        config.breaker.half_open_max_inflight,
    );
    let rate_limiter =
        RateLimiter::new(config.rate_limit.capacity, config.rate_limit.refill_per_sec, config.rate_limit.mode);

    Ok(SinkHandle { sink, breaker, rate_limiter, retry: config.retry.clone(), timeout_ms })
}

fn register_listeners(
    supervisor: &mut Supervisor,
    config: &Config,
    enqueue: Arc<EnqueueHandle>,
    wake: Arc<Notify>,
    metrics: Arc<Metrics>,
) {
    if config.inputs.syslog_udp.enabled {
        let bind = config.inputs.syslog_udp.bind.clone().unwrap_or_else(|| "0.0.0.0:5514".to_string());
        let listener: Arc<dyn Listener> = Arc::new(listener::syslog_udp::SyslogUdpListener::new(bind, metrics.clone()));
        register_listener_task(supervisor, "syslog_udp", listener, enqueue.clone(), wake.clone());
    }

    if config.inputs.file_tail.enabled {
        if let Some(path) = &config.inputs.file_tail.path {
            let listener: Arc<dyn Listener> = Arc::new(listener::file_tail::FileTailListener::new(path.clone()));
            register_listener_task(supervisor, "file_tail", listener, enqueue.clone(), wake.clone());
        }
    }
}

fn register_listener_task(
    supervisor: &mut Supervisor,
    name: &str,
    listener: Arc<dyn Listener>,
    enqueue: Arc<EnqueueHandle>,
    _wake: Arc<Notify>,
) {
    supervisor.register(
        name,
        Arc::new(move |shutdown_rx| {
            let listener = listener.clone();
            let enqueue = enqueue.clone();
            Box::pin(async move {
                listener.run(enqueue, shutdown_rx).await;
                Ok(())
            })
        }),
    );
}

/// Periodically mirrors spool size and per-component health into the
/// metrics registry; these are sampled rather than updated event-by-event.
async fn poll_gauges(spool: Arc<dyn Spool>, supervisor: Arc<Supervisor>, metrics: Arc<Metrics>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
    loop {
        interval.tick().await;
        if let Ok(stats) = spool.stats().await {
            metrics.set_spool_stats(&stats);
        }
        for (name, status) in supervisor.status().await {
            metrics.component_healthy(&name, status.healthy);
        }
    }
}

fn default_node_identity() -> String {
    whoami::fallible::hostname().unwrap_or_else(|_| whoami::username())
}
