//! 転送対象（desired state）の導出
//!
//! 生の TCP レコードから、ループバックで LISTEN しているソケットだけを取り出し、
//! `addr:port` をキーとするマップにまとめます。

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::tcp_state::TcpConnRecord;

/// リスナーの識別キー
///
/// `"127.0.0.1:8080"` / `"[::1]:8080"` の形式。inode などティックごとに変わる属性は含めない。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ListenerId(String);

impl ListenerId {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        // SocketAddr の Display は IPv6 をブラケットで囲む
        Self(SocketAddr::new(addr, port).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// カーネル上で観測された LISTEN ソケット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListeningSocket {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub is_loopback: bool,
}

impl ListeningSocket {
    /// 転送先（ループバック上のサービス）
    pub fn target(&self) -> SocketAddr {
        SocketAddr::new(self.local_addr, self.local_port)
    }

    pub fn id(&self) -> ListenerId {
        ListenerId::new(self.local_addr, self.local_port)
    }
}

/// 転送すべきリスナーの集合
pub type DesiredPortSet = BTreeMap<ListenerId, ListeningSocket>;

/// 導出時の除外条件
#[derive(Debug, Clone, Default)]
pub struct DesiredStateFilter {
    /// 転送しないポート（エージェント自身の API ポートなど）
    pub excluded_ports: HashSet<u16>,
    /// 転送しないアドレス（プロキシ自身の bind アドレス）
    pub excluded_addrs: HashSet<IpAddr>,
}

impl DesiredStateFilter {
    fn excludes(&self, addr: &IpAddr, port: u16) -> bool {
        self.excluded_ports.contains(&port) || self.excluded_addrs.contains(addr)
    }
}

/// レコード列から転送対象を導出
///
/// - LISTEN 状態のみ
/// - ループバック（127.0.0.0/8, ::1）のみ。IPv4-mapped IPv6 は IPv4 として扱う
/// - `filter` に該当するものは除外
///
/// 副作用のない純粋関数で、同じ入力に対して常に同じ結果を返す。
pub fn derive_desired_state(
    records: &[TcpConnRecord],
    filter: &DesiredStateFilter,
) -> DesiredPortSet {
    records
        .iter()
        .filter(|record| record.is_listening())
        .filter_map(|record| {
            let local_addr = record.local_addr.to_canonical();
            if filter.excludes(&local_addr, record.local_port) {
                return None;
            }
            let socket = ListeningSocket {
                local_addr,
                local_port: record.local_port,
                is_loopback: local_addr.is_loopback(),
            };
            socket.is_loopback.then(|| (socket.id(), socket))
        })
        .collect()
}
