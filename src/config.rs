//! エージェント設定

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::desired::DesiredStateFilter;
use crate::proxy::ProxySettings;

/// ワークスペースコンテナの IP アドレス
pub const DEFAULT_BIND_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(172, 20, 0, 2));

/// エージェント設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// プロキシが listen するコンテナのアドレス（ワイルドカードは使わない）
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// カーネル TCP 状態のポーリング間隔（ミリ秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// ループバック側への接続タイムアウト（ミリ秒）
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// procfs のマウントポイント
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    /// ステータス API のリッスンアドレス（None で無効）
    #[serde(default)]
    pub api_listen: Option<SocketAddr>,

    /// 転送しないポート
    #[serde(default)]
    pub excluded_ports: Vec<u16>,
}

fn default_bind_addr() -> IpAddr {
    DEFAULT_BIND_ADDR
}

fn default_poll_interval_ms() -> u64 {
    60
}

fn default_dial_timeout_ms() -> u64 {
    5000
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            poll_interval_ms: default_poll_interval_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
            proc_root: default_proc_root(),
            api_listen: None,
            excluded_ports: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
        }
    }

    /// 転送対象の除外条件
    ///
    /// 明示的な除外ポートに加えて、API ポートとプロキシ自身の bind アドレスを除外する。
    pub fn desired_state_filter(&self) -> DesiredStateFilter {
        let mut excluded_ports: HashSet<u16> = self.excluded_ports.iter().copied().collect();
        if let Some(api) = self.api_listen {
            excluded_ports.insert(api.port());
        }
        DesiredStateFilter {
            excluded_ports,
            excluded_addrs: [self.bind_addr.to_canonical()].into_iter().collect(),
        }
    }
}
