//! カーネル TCP 状態の収集
//!
//! `/proc/net/tcp` と `/proc/net/tcp6` を読み取り、ソケットごとの生レコードを返します。
//!
//! ## 行フォーマット
//!
//! ```text
//!   sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
//!    0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 ...
//! ```
//!
//! - アドレスは `HEXIP:HEXPORT` 形式
//! - HEXIP は 32bit ワード（IPv4 は 1 個、IPv6 は 4 個）をホストバイトオーダーで出力したもの
//! - ポートはビッグエンディアンの 16 進数
//! - `st` は TCP 状態コード（`0A` = LISTEN）

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// 収集エラー
#[derive(Error, Debug)]
pub enum CollectorError {
    /// TCP テーブルを読み取れない（権限不足、/proc が存在しないなど）
    #[error("kernel TCP state unavailable: could not read {path}: {source}")]
    KernelStateUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed row: {0}")]
    MalformedRow(String),

    /// 読み取りタスクが異常終了した
    #[error("collector task failed: {0}")]
    TaskFailed(String),
}

/// アドレスファミリー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Inet => write!(f, "tcp"),
            AddressFamily::Inet6 => write!(f, "tcp6"),
        }
    }
}

/// TCP 状態コード（include/net/tcp_states.h）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TcpState {
    Established = 0x01,
    SynSent = 0x02,
    SynRecv = 0x03,
    FinWait1 = 0x04,
    FinWait2 = 0x05,
    TimeWait = 0x06,
    Close = 0x07,
    CloseWait = 0x08,
    LastAck = 0x09,
    Listen = 0x0A,
    Closing = 0x0B,
}

impl TryFrom<u8> for TcpState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(TcpState::Established),
            0x02 => Ok(TcpState::SynSent),
            0x03 => Ok(TcpState::SynRecv),
            0x04 => Ok(TcpState::FinWait1),
            0x05 => Ok(TcpState::FinWait2),
            0x06 => Ok(TcpState::TimeWait),
            0x07 => Ok(TcpState::Close),
            0x08 => Ok(TcpState::CloseWait),
            0x09 => Ok(TcpState::LastAck),
            0x0A => Ok(TcpState::Listen),
            0x0B => Ok(TcpState::Closing),
            other => Err(other),
        }
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Established => "ESTABLISHED",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRecv => "SYN_RECV",
            TcpState::FinWait1 => "FIN_WAIT1",
            TcpState::FinWait2 => "FIN_WAIT2",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::Close => "CLOSE",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::Listen => "LISTEN",
            TcpState::Closing => "CLOSING",
        };
        write!(f, "{}", name)
    }
}

/// カーネル TCP テーブルの 1 行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpConnRecord {
    pub family: AddressFamily,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    /// 生の状態コード
    pub state: u8,
    /// ソケット inode（毎回変わりうるので識別子には使わない）
    pub inode: u64,
}

impl TcpConnRecord {
    /// LISTEN 状態かどうか
    pub fn is_listening(&self) -> bool {
        self.tcp_state() == Some(TcpState::Listen)
    }

    /// 状態コードを解釈（未知のコードは None）
    pub fn tcp_state(&self) -> Option<TcpState> {
        TcpState::try_from(self.state).ok()
    }
}

/// TCP 状態の取得元
///
/// 本番では [`ProcNetTcp`]、テストでは任意の固定レコードを返す実装を使う。
/// `collect` はブロッキングしてよい（リコンサイラは blocking スレッドから呼び出す）。
pub trait TcpStateSource: Send + Sync + 'static {
    fn collect(&self) -> Result<Vec<TcpConnRecord>, CollectorError>;
}

/// `/proc/net/tcp{,6}` からの読み取り
#[derive(Debug, Clone)]
pub struct ProcNetTcp {
    proc_root: PathBuf,
}

impl ProcNetTcp {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    fn read_table(&self, name: &str, family: AddressFamily) -> Result<Vec<TcpConnRecord>, CollectorError> {
        let path = self.proc_root.join("net").join(name);
        let content = std::fs::read_to_string(&path)
            .map_err(|source| CollectorError::KernelStateUnavailable { path: path.clone(), source })?;
        Ok(parse_table(&content, family))
    }
}

impl TcpStateSource for ProcNetTcp {
    fn collect(&self) -> Result<Vec<TcpConnRecord>, CollectorError> {
        let mut records = self.read_table("tcp", AddressFamily::Inet)?;
        records.extend(self.read_table("tcp6", AddressFamily::Inet6)?);
        Ok(records)
    }
}

// =============================================================================
// パース
// =============================================================================

/// テーブル全体をパース（ヘッダ行をスキップ、不正な行は読み飛ばす）
pub fn parse_table(content: &str, family: AddressFamily) -> Vec<TcpConnRecord> {
    content
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match parse_row(line, family) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!("Skipping {} row: {}", family, e);
                None
            }
        })
        .collect()
}

/// 1 行をパース
pub fn parse_row(line: &str, family: AddressFamily) -> Result<TcpConnRecord, CollectorError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return Err(CollectorError::MalformedRow(format!(
            "expected at least 10 columns, got {}",
            parts.len()
        )));
    }

    let (local_addr, local_port) = parse_endpoint(parts[1], family)?;
    let (remote_addr, remote_port) = parse_endpoint(parts[2], family)?;
    let state = u8::from_str_radix(parts[3], 16)
        .map_err(|e| CollectorError::MalformedRow(format!("state {:?}: {}", parts[3], e)))?;
    let inode = parts[9]
        .parse::<u64>()
        .map_err(|e| CollectorError::MalformedRow(format!("inode {:?}: {}", parts[9], e)))?;

    Ok(TcpConnRecord {
        family,
        local_addr,
        local_port,
        remote_addr,
        remote_port,
        state,
        inode,
    })
}

/// `HEXIP:HEXPORT` をパース
fn parse_endpoint(field: &str, family: AddressFamily) -> Result<(IpAddr, u16), CollectorError> {
    let (ip_hex, port_hex) = field
        .split_once(':')
        .ok_or_else(|| CollectorError::MalformedRow(format!("address {:?} has no port", field)))?;

    let port = u16::from_str_radix(port_hex, 16)
        .map_err(|e| CollectorError::MalformedRow(format!("port {:?}: {}", port_hex, e)))?;

    let ip = match family {
        AddressFamily::Inet => IpAddr::V4(parse_ipv4_hex(ip_hex)?),
        AddressFamily::Inet6 => IpAddr::V6(parse_ipv6_hex(ip_hex)?),
    };

    Ok((ip, port))
}

fn parse_word(hex: &str) -> Result<[u8; 4], CollectorError> {
    let word = u32::from_str_radix(hex, 16)
        .map_err(|e| CollectorError::MalformedRow(format!("address word {:?}: {}", hex, e)))?;
    // カーネルは __be32 をホストの u32 として出力する
    Ok(word.to_ne_bytes())
}

fn parse_ipv4_hex(hex: &str) -> Result<Ipv4Addr, CollectorError> {
    if hex.len() != 8 {
        return Err(CollectorError::MalformedRow(format!("IPv4 address {:?}", hex)));
    }
    Ok(Ipv4Addr::from(parse_word(hex)?))
}

fn parse_ipv6_hex(hex: &str) -> Result<Ipv6Addr, CollectorError> {
    if hex.len() != 32 || !hex.is_ascii() {
        return Err(CollectorError::MalformedRow(format!("IPv6 address {:?}", hex)));
    }
    let mut octets = [0u8; 16];
    for i in 0..4 {
        let word = parse_word(&hex[i * 8..(i + 1) * 8])?;
        octets[i * 4..(i + 1) * 4].copy_from_slice(&word);
    }
    Ok(Ipv6Addr::from(octets))
}
