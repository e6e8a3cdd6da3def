//! loopfwd CLI エントリーポイント

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use loopfwd::api::{self, ApiState};
use loopfwd::config::AgentConfig;
use loopfwd::reconciler::Reconciler;
use loopfwd::statistics::AgentStatistics;
use loopfwd::tcp_state::ProcNetTcp;

/// ログ出力形式
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    /// 人間が読みやすい形式
    #[default]
    Console,
    /// JSON 形式（構造化ログ）
    Json,
}

/// Forwards loopback-only TCP listeners to the container's external address
#[derive(Parser, Debug)]
#[command(name = "loopfwd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, default_value = "console", env = "LOOPFWD_LOG_FORMAT")]
    log_format: LogFormat,

    /// Log output file (default: stdout)
    #[arg(long, env = "LOOPFWD_LOG_OUTPUT")]
    log_output: Option<PathBuf>,

    /// Address the proxies listen on (the container's external address)
    #[arg(long, default_value = "172.20.0.2", env = "LOOPFWD_BIND_ADDR")]
    bind_addr: IpAddr,

    /// Interval between kernel TCP table scans in milliseconds
    #[arg(long, default_value = "60", env = "LOOPFWD_POLL_INTERVAL_MS")]
    poll_interval_ms: u64,

    /// Timeout for connecting to the loopback service in milliseconds
    #[arg(long, default_value = "5000", env = "LOOPFWD_DIAL_TIMEOUT_MS")]
    dial_timeout_ms: u64,

    /// procfs mount point
    #[arg(long, default_value = "/proc", env = "LOOPFWD_PROC_ROOT")]
    proc_root: PathBuf,

    /// Address for the status API (/healthcheck, /metrics, /api/v1/*). Disabled if omitted
    #[arg(long, env = "LOOPFWD_API_LISTEN")]
    api_listen: Option<SocketAddr>,

    /// Ports that are never forwarded (comma separated)
    #[arg(long = "exclude-port", env = "LOOPFWD_EXCLUDE_PORTS", value_delimiter = ',')]
    exclude_ports: Vec<u16>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            bind_addr: self.bind_addr,
            poll_interval_ms: self.poll_interval_ms,
            dial_timeout_ms: self.dial_timeout_ms,
            proc_root: self.proc_root.clone(),
            api_listen: self.api_listen,
            excluded_ports: self.exclude_ports.clone(),
        }
    }
}

/// ログ出力先の MakeWriter 実装（append モードのファイル）
#[derive(Clone)]
struct FileWriter(Arc<Mutex<std::fs::File>>);

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?
            .flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FileWriter {
    type Writer = FileWriter;
    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn init_logging(format: LogFormat, output: Option<&PathBuf>) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let writer = match output {
        Some(log_path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .with_context(|| format!("Failed to open log file: {:?}", log_path))?;
            BoxMakeWriter::new(FileWriter(Arc::new(Mutex::new(file))))
        }
        None => BoxMakeWriter::new(io::stdout),
    };

    match format {
        LogFormat::Console => {
            tracing_subscriber::fmt()
                .with_writer(writer)
                .with_env_filter(env_filter)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_writer(writer)
                .with_env_filter(env_filter)
                .json()
                .init();
        }
    }
    Ok(())
}

/// SIGINT / SIGTERM のハンドラー
///
/// 起動時に登録し、登録に失敗した場合は起動エラーとする。
#[cfg(unix)]
struct ShutdownSignals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// シグナルを受信するまで待機し、シグナル名を返す
    async fn recv(mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    fn install() -> io::Result<Self> {
        Ok(Self)
    }

    async fn recv(self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "Ctrl+C",
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending().await
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.agent_config();

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    init_logging(cli.log_format, cli.log_output.as_ref())?;

    let source = ProcNetTcp::new(&config.proc_root);
    info!(
        "Starting loopfwd (bind: {}, proc: {:?}, poll interval: {}ms)",
        config.bind_addr,
        source.proc_root(),
        config.poll_interval_ms
    );
    if config.bind_addr.is_unspecified() {
        warn!("Proxies bind to a wildcard address; loopback listeners may collide with their own proxies");
    }

    let statistics = Arc::new(AgentStatistics::new());
    let reconciler = Reconciler::new(&config, statistics.clone());
    let shutdown = CancellationToken::new();

    // シグナル受信でシャットダウン
    let signals = ShutdownSignals::install().context("Failed to install signal handlers")?;
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let name = signals.recv().await;
            info!("Received {}, shutting down...", name);
            shutdown.cancel();
        });
    }

    let api_task = match config.api_listen {
        Some(listen) => {
            let listener = tokio::net::TcpListener::bind(listen)
                .await
                .with_context(|| format!("Failed to bind API server on {}", listen))?;
            info!("API server listening on {}", listen);
            let state = ApiState {
                statistics: statistics.clone(),
                proxies: reconciler.subscribe(),
            };
            Some(tokio::spawn(api::serve(listener, state, shutdown.clone())))
        }
        None => None,
    };

    let result = reconciler.run(source, shutdown.clone()).await;

    // API サーバーも止める
    shutdown.cancel();
    if let Some(task) = api_task {
        match task.await {
            Ok(Err(e)) => error!("API server error: {:#}", e),
            Err(e) => error!("API server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    result.context("Kernel TCP state is unavailable")?;
    info!("loopfwd stopped");
    Ok(())
}
