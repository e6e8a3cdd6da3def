//! エージェント統計情報
//!
//! プロキシ数、転送接続数、転送量などを追跡するための構造体とメソッドを提供します。
//! Prometheus 形式でのメトリクスエクスポートに対応しています。

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// エージェント統計情報を保持する構造体
///
/// すべてのフィールドは Atomic 型で、複数タスクから安全にアクセス可能です。
pub struct AgentStatistics {
    /// エージェント開始時刻
    start_time: Instant,
    /// リコンサイル実行回数
    reconcile_ticks: AtomicU64,

    // プロキシメトリクス
    /// 起動したプロキシの累計
    proxies_started: AtomicU64,
    /// 停止したプロキシの累計
    proxies_stopped: AtomicU64,
    /// 現在稼働中のプロキシ数
    proxies_active: AtomicU64,
    /// bind 失敗回数
    bind_failures: AtomicU64,

    // 接続メトリクス
    /// 転送を開始した接続の累計
    connections_total: AtomicU64,
    /// 現在転送中の接続数
    connections_active: AtomicU64,
    /// ループバック側への接続失敗回数
    dial_failures: AtomicU64,
    /// 外部 → ループバックの転送バイト数
    bytes_to_local: AtomicU64,
    /// ループバック → 外部の転送バイト数
    bytes_to_external: AtomicU64,
}

impl AgentStatistics {
    /// 新しい統計情報インスタンスを作成
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            reconcile_ticks: AtomicU64::new(0),
            proxies_started: AtomicU64::new(0),
            proxies_stopped: AtomicU64::new(0),
            proxies_active: AtomicU64::new(0),
            bind_failures: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            dial_failures: AtomicU64::new(0),
            bytes_to_local: AtomicU64::new(0),
            bytes_to_external: AtomicU64::new(0),
        }
    }

    pub fn reconcile_tick(&self) {
        self.reconcile_ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// プロキシが起動したときに呼び出す
    pub fn proxy_started(&self) {
        self.proxies_started.fetch_add(1, Ordering::Relaxed);
        self.proxies_active.fetch_add(1, Ordering::Relaxed);
    }

    /// プロキシが停止したときに呼び出す
    pub fn proxy_stopped(&self) {
        self.proxies_stopped.fetch_add(1, Ordering::Relaxed);
        self.proxies_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn bind_failed(&self) {
        self.bind_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// 転送接続が開始されたときに呼び出す
    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// 転送接続が終了したときに呼び出す
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn dial_failed(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// 外部 → ループバックの転送バイト数を加算
    pub fn add_bytes_to_local(&self, bytes: u64) {
        self.bytes_to_local.fetch_add(bytes, Ordering::Relaxed);
    }

    /// ループバック → 外部の転送バイト数を加算
    pub fn add_bytes_to_external(&self, bytes: u64) {
        self.bytes_to_external.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn proxies_active(&self) -> u64 {
        self.proxies_active.load(Ordering::Relaxed)
    }

    pub fn connections_active(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    pub fn connections_total(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn dial_failures(&self) -> u64 {
        self.dial_failures.load(Ordering::Relaxed)
    }

    pub fn bytes_to_local(&self) -> u64 {
        self.bytes_to_local.load(Ordering::Relaxed)
    }

    pub fn bytes_to_external(&self) -> u64 {
        self.bytes_to_external.load(Ordering::Relaxed)
    }

    /// Prometheus 形式でメトリクスを出力
    pub fn to_prometheus(&self) -> String {
        let metrics: [(&str, &str, &str, u64); 11] = [
            (
                "loopfwd_uptime_seconds",
                "gauge",
                "Agent uptime in seconds",
                self.start_time.elapsed().as_secs(),
            ),
            (
                "loopfwd_reconcile_ticks_total",
                "counter",
                "Total number of reconciliation passes",
                self.reconcile_ticks.load(Ordering::Relaxed),
            ),
            (
                "loopfwd_proxies_started_total",
                "counter",
                "Total number of proxies started",
                self.proxies_started.load(Ordering::Relaxed),
            ),
            (
                "loopfwd_proxies_stopped_total",
                "counter",
                "Total number of proxies stopped",
                self.proxies_stopped.load(Ordering::Relaxed),
            ),
            (
                "loopfwd_proxies_active",
                "gauge",
                "Current number of running proxies",
                self.proxies_active(),
            ),
            (
                "loopfwd_bind_failures_total",
                "counter",
                "Total number of failed proxy listener binds",
                self.bind_failures.load(Ordering::Relaxed),
            ),
            (
                "loopfwd_connections_total",
                "counter",
                "Total number of forwarded connections",
                self.connections_total(),
            ),
            (
                "loopfwd_connections_active",
                "gauge",
                "Current number of forwarded connections",
                self.connections_active(),
            ),
            (
                "loopfwd_dial_failures_total",
                "counter",
                "Total number of failed loopback dials",
                self.dial_failures(),
            ),
            (
                "loopfwd_bytes_to_local_total",
                "counter",
                "Total bytes relayed from external peers to loopback services",
                self.bytes_to_local(),
            ),
            (
                "loopfwd_bytes_to_external_total",
                "counter",
                "Total bytes relayed from loopback services to external peers",
                self.bytes_to_external(),
            ),
        ];

        let mut output = String::new();
        for (name, kind, help, value) in metrics {
            // String への書き込みは失敗しない
            let _ = writeln!(output, "# HELP {} {}", name, help);
            let _ = writeln!(output, "# TYPE {} {}", name, kind);
            let _ = writeln!(output, "{} {}", name, value);
        }
        output
    }
}

impl Default for AgentStatistics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_counters() {
        let stats = AgentStatistics::new();
        stats.proxy_started();
        stats.proxy_started();
        stats.proxy_stopped();
        assert_eq!(stats.proxies_active(), 1);

        let text = stats.to_prometheus();
        assert!(text.contains("loopfwd_proxies_started_total 2"));
        assert!(text.contains("loopfwd_proxies_stopped_total 1"));
        assert!(text.contains("loopfwd_proxies_active 1"));
    }

    #[test]
    fn test_prometheus_format() {
        let stats = AgentStatistics::new();
        stats.connection_opened();
        stats.add_bytes_to_local(10);
        stats.add_bytes_to_external(20);

        let text = stats.to_prometheus();
        assert!(text.contains("# TYPE loopfwd_connections_total counter"));
        assert!(text.contains("# TYPE loopfwd_connections_active gauge"));
        assert!(text.contains("loopfwd_bytes_to_local_total 10"));
        assert!(text.contains("loopfwd_bytes_to_external_total 20"));
    }
}
