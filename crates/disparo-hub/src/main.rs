mod context;
mod gateway;
mod pipeline;
mod realtime;
mod routes;

use clap::Parser;
use context::{AppContext, ContextConfig, ObserverConfig};
use disparo_core::delay::{DelayConfig, DEFAULT_DELAY_SECONDS};
use gateway::{BridgeConfig, BridgeGateway};
use routes::{build_router, RouterOptions};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use url::Url;

const DEFAULT_ADDR: &str = "127.0.0.1:3001";
const DEFAULT_BRIDGE_URL: &str = "ws://127.0.0.1:3101/bridge";
const DEFAULT_AUTH_DIR: &str = "auth_info_baileys";
const DEFAULT_CORS_ORIGINS: &str = "http://localhost:3000,http://localhost:3002,http://localhost:5173";
const DEFAULT_LOG_DIR: &str = ".disparo/logs";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    bridge_url: String,
    auth_dir: PathBuf,
    delay_seconds: f64,
    cors_origins: Vec<String>,
    send_timeout: Duration,
    ping_interval: Duration,
    write_timeout: Duration,
    max_upload_bytes: usize,
    debug: bool,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "disparo-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    bridge_url: String,
    #[arg(long, default_value = "")]
    auth_dir: String,
    #[arg(long)]
    delay_seconds: Option<f64>,
    #[arg(long, default_value = "")]
    cors_origins: String,
    #[arg(long, default_value_t = 30)]
    send_timeout: u64,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    max_upload_bytes: usize,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);

    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            std::process::exit(2);
        }
    };
    let bridge_url = match Url::parse(&config.bridge_url) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_bridge_url", error = %err, url = %config.bridge_url);
            std::process::exit(2);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway = BridgeGateway::spawn(
        BridgeConfig {
            url: bridge_url,
            send_timeout: config.send_timeout,
        },
        shutdown_rx,
    );
    let delay = DelayConfig::from_base(config.delay_seconds);
    let ctx = AppContext::start(
        ContextConfig {
            delay,
            auth_dir: config.auth_dir.clone(),
            observer: ObserverConfig {
                ping_interval: config.ping_interval,
                write_timeout: config.write_timeout,
            },
            pacer: None,
        },
        gateway,
    );
    let app = build_router(
        ctx,
        &RouterOptions {
            cors_origins: config.cors_origins.clone(),
            max_upload_bytes: config.max_upload_bytes,
        },
    );

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err, addr = %addr);
            std::process::exit(1);
        }
    };

    info!(
        event = "hub_start",
        addr = %addr,
        bridge_url = %config.bridge_url,
        delay = %delay.description()
    );

    let shutdown = async move {
        wait_for_signal().await;
        info!(event = "hub_shutdown");
        let _ = shutdown_tx.send(true);
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(event = "signal_error", error = %err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(event = "signal_error", error = %err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    let debug = args.debug || env_true("DISPARO_DEBUG");
    Config {
        addr: resolve_flag(&args.addr, "DISPARO_ADDR", DEFAULT_ADDR),
        bridge_url: resolve_flag(&args.bridge_url, "DISPARO_BRIDGE_URL", DEFAULT_BRIDGE_URL),
        auth_dir: PathBuf::from(resolve_flag(&args.auth_dir, "DISPARO_AUTH_DIR", DEFAULT_AUTH_DIR)),
        delay_seconds: resolve_delay_seconds(args.delay_seconds),
        cors_origins: split_origins(&resolve_flag(
            &args.cors_origins,
            "DISPARO_CORS_ORIGINS",
            DEFAULT_CORS_ORIGINS,
        )),
        send_timeout: Duration::from_secs(args.send_timeout),
        ping_interval: Duration::from_secs(args.ping_interval),
        write_timeout: Duration::from_secs(args.write_timeout),
        max_upload_bytes: args.max_upload_bytes,
        debug,
        log_dir: resolve_flag(&args.log_dir, "DISPARO_LOG_DIR", DEFAULT_LOG_DIR),
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if let Ok(level) = std::env::var("DISPARO_LOG_LEVEL") {
        level
    } else if config.debug {
        "debug".to_string()
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Tees formatted log lines to stdout and the optional log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("disparo-hub.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

/// Flag, then environment, then default.
fn resolve_flag(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    default.to_string()
}

fn resolve_delay_seconds(flag: Option<f64>) -> f64 {
    if let Some(value) = flag {
        return value;
    }
    match std::env::var("DISPARO_DELAY_SECONDS") {
        Ok(value) => match value.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                eprintln!("invalid DISPARO_DELAY_SECONDS={value:?}, using {DEFAULT_DELAY_SECONDS}");
                DEFAULT_DELAY_SECONDS
            }
        },
        Err(_) => DEFAULT_DELAY_SECONDS,
    }
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}
