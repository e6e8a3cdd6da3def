//! プロキシのライフサイクル管理
//!
//! 転送対象のリスナー 1 つにつき 1 つのプロキシを起動します。
//! プロキシはコンテナのアドレス上で外部向けリスナーを持ち、受け付けた接続を
//! ループバック上のサービスへ中継します。
//!
//! ## 停止
//!
//! `stop()` でキャンセルトークンを発火すると、accept ループがリスナーを drop して終了します。
//! 中継中の接続はキャンセルされず、自然に終了するまで動作を続けます。

use serde::Serialize;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::desired::{ListenerId, ListeningSocket};
use crate::forwarder;
use crate::statistics::AgentStatistics;

/// 接続 ID カウンター
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// accept エラー後の待機時間（fd 枯渇時などのビジーループ防止）
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// リスナーの backlog
const LISTEN_BACKLOG: i32 = 128;

/// プロキシエラー
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("failed to bind proxy listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {target}: {source}")]
    Dial {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to {target} after {timeout:?}")]
    DialTimeout { target: SocketAddr, timeout: Duration },
}

/// プロキシ共通設定
#[derive(Debug, Clone, Copy)]
pub struct ProxySettings {
    /// ループバック側への接続タイムアウト
    pub dial_timeout: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
        }
    }
}

/// プロキシの読み取り専用サマリー（API 用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxySummary {
    /// リスナー識別キー
    pub id: ListenerId,
    /// 転送しているポート
    pub listening_port: u16,
    /// 外部向けリスナーのアドレス
    pub bind_addr: String,
    /// 転送先
    pub target_addr: String,
    /// 起動時刻（UNIX タイムスタンプ）
    pub started_at: u64,
}

/// 稼働中のプロキシ
///
/// リコンサイラだけが生成・停止する。
#[derive(Debug)]
pub struct ProxyHandle {
    id: ListenerId,
    listening_port: u16,
    target_addr: SocketAddr,
    bind_addr: SocketAddr,
    started_at: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    /// プロキシを起動
    ///
    /// `<bind_ip>:<listener のポート>` で listen し、accept ループをタスクとして起動する。
    /// tokio ランタイム上で呼び出すこと。
    pub fn start(
        listener: &ListeningSocket,
        bind_ip: IpAddr,
        settings: ProxySettings,
        statistics: Arc<AgentStatistics>,
    ) -> Result<Self, ProxyError> {
        let requested = SocketAddr::new(bind_ip, listener.local_port);
        let tcp_listener = create_tcp_listener_with_reuseaddr(requested)
            .and_then(TcpListener::from_std)
            .map_err(|source| ProxyError::Bind {
                addr: requested,
                source,
            })?;
        let bind_addr = tcp_listener.local_addr().unwrap_or(requested);

        let id = listener.id();
        let target_addr = listener.target();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(accept_loop(
            tcp_listener,
            id.clone(),
            target_addr,
            cancel.clone(),
            settings,
            statistics,
        ));

        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Ok(Self {
            id,
            listening_port: listener.local_port,
            target_addr,
            bind_addr,
            started_at,
            cancel,
            task,
        })
    }

    pub fn id(&self) -> &ListenerId {
        &self.id
    }

    pub fn listening_port(&self) -> u16 {
        self.listening_port
    }

    pub fn target_addr(&self) -> SocketAddr {
        self.target_addr
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// プロキシを停止
    ///
    /// 何度呼び出してもよい。この呼び出しでキャンセルを発火した場合のみ true を返す。
    pub fn stop(&self) -> bool {
        if self.cancel.is_cancelled() {
            debug!("Proxy for {} already stopped", self.id);
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// リスナーが閉じられるまで待機
    ///
    /// `stop()` を呼ばずに待つと、プロキシが停止するまで返らない。
    pub async fn wait_closed(self) {
        if let Err(e) = self.task.await {
            error!("Accept loop for {} panicked: {}", self.id, e);
        }
    }

    pub fn summary(&self) -> ProxySummary {
        ProxySummary {
            id: self.id.clone(),
            listening_port: self.listening_port,
            bind_addr: self.bind_addr.to_string(),
            target_addr: self.target_addr.to_string(),
            started_at: self.started_at,
        }
    }
}

/// SO_REUSEADDR 付きで TCP リスナーを作成
///
/// 停止直後のプロキシが TIME_WAIT を残していても同じポートで再度 listen できるようにする。
fn create_tcp_listener_with_reuseaddr(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// ループバック上のサービスに接続
async fn dial(target: SocketAddr, timeout: Duration) -> Result<TcpStream, ProxyError> {
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ProxyError::Dial { target, source }),
        Err(_) => Err(ProxyError::DialTimeout { target, timeout }),
    }
}

/// accept ループ
///
/// キャンセルされるとリスナーを drop（= close）して終了する。
async fn accept_loop(
    listener: TcpListener,
    id: ListenerId,
    target: SocketAddr,
    cancel: CancellationToken,
    settings: ProxySettings,
    statistics: Arc<AgentStatistics>,
) {
    let bind_addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    info!("Proxy listening on {} -> {}", bind_addr, target);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Proxy for {} cancelled", id);
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((external, peer_addr)) => {
                        let conn_id = CONNECTION_ID_COUNTER.fetch_add(1, Ordering::SeqCst);
                        debug!("[{}] Accepted {} on {}", conn_id, peer_addr, bind_addr);

                        // dial 中も accept とキャンセルを止めない
                        let timeout = settings.dial_timeout;
                        let stats = statistics.clone();
                        tokio::spawn(async move {
                            match dial(target, timeout).await {
                                Ok(local) => forwarder::forward(conn_id, external, local, stats).await,
                                Err(e) => {
                                    stats.dial_failed();
                                    warn!("[{}] Dropping connection from {}: {}", conn_id, peer_addr, e);
                                    drop(external);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        warn!("Error accepting connection on proxy for {}: {}", id, e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }
    }

    drop(listener);
    info!("Proxy on {} closed", bind_addr);
}
