//! リコンサイラ
//!
//! 一定間隔でカーネルの TCP 状態を取得し、転送対象の集合と稼働中のプロキシ集合の差分を取って
//! プロキシを起動・停止します。
//!
//! ## キーごとの状態
//!
//! ```text
//! absent ──(対象に出現 / bind 成功)──> proxied
//! proxied ──(対象から消失 / stop)──> absent
//! ```
//!
//! bind に失敗したキーは absent のまま残り、次のティックで再試行されます。
//! 稼働中のプロキシ集合はリコンサイラのタスクだけが変更するため、ロックは持ちません。
//! 他のタスクには `watch` チャネル経由で読み取り専用のスナップショットを公開します。

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::desired::{derive_desired_state, DesiredStateFilter, ListenerId};
use crate::proxy::{ProxyError, ProxyHandle, ProxySettings, ProxySummary};
use crate::statistics::AgentStatistics;
use crate::tcp_state::{CollectorError, TcpConnRecord, TcpStateSource};

/// 1 ティック分の結果
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// 新たに起動したプロキシ
    pub started: Vec<ListenerId>,
    /// 停止したプロキシ（リスナーのクローズは非同期に完了する）
    pub stopped: Vec<ProxyHandle>,
    /// bind に失敗したキー
    pub bind_failures: Vec<(ListenerId, ProxyError)>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.bind_failures.is_empty()
    }
}

pub struct Reconciler {
    bind_ip: IpAddr,
    filter: DesiredStateFilter,
    settings: ProxySettings,
    poll_interval: Duration,
    /// 稼働中のプロキシ（キーごとに高々 1 つ）
    proxies: HashMap<ListenerId, ProxyHandle>,
    /// bind に失敗し続けているキー（警告とカウントの重複抑制用）
    bind_failing: HashSet<ListenerId>,
    statistics: Arc<AgentStatistics>,
    snapshot_tx: watch::Sender<Vec<ProxySummary>>,
}

impl Reconciler {
    pub fn new(config: &AgentConfig, statistics: Arc<AgentStatistics>) -> Self {
        let (snapshot_tx, _) = watch::channel(Vec::new());
        Self {
            bind_ip: config.bind_addr,
            filter: config.desired_state_filter(),
            settings: config.proxy_settings(),
            poll_interval: config.poll_interval(),
            proxies: HashMap::new(),
            bind_failing: HashSet::new(),
            statistics,
            snapshot_tx,
        }
    }

    /// 稼働中プロキシのスナップショットを購読
    pub fn subscribe(&self) -> watch::Receiver<Vec<ProxySummary>> {
        self.snapshot_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn get(&self, id: &ListenerId) -> Option<&ProxyHandle> {
        self.proxies.get(id)
    }

    /// 稼働中プロキシのキー（ソート済み）
    pub fn live_ids(&self) -> Vec<ListenerId> {
        let mut ids: Vec<ListenerId> = self.proxies.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 1 回分の差分適用
    ///
    /// 停止を先に処理してから起動する。tokio ランタイム上で呼び出すこと。
    pub fn reconcile(&mut self, records: &[TcpConnRecord]) -> ReconcileReport {
        self.statistics.reconcile_tick();
        let desired = derive_desired_state(records, &self.filter);
        let mut report = ReconcileReport::default();

        // proxied -> absent
        let gone: Vec<ListenerId> = self
            .proxies
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            if let Some(handle) = self.proxies.remove(&id) {
                handle.stop();
                self.statistics.proxy_stopped();
                info!("Listener {} disappeared, stopped proxy on {}", handle.id(), handle.bind_addr());
                report.stopped.push(handle);
            }
        }

        // bind 失敗の記録は、対象から外れたキーについては忘れる
        self.bind_failing.retain(|id| desired.contains_key(id));

        // absent -> proxied
        for (id, listener) in &desired {
            if self.proxies.contains_key(id) {
                continue;
            }
            match ProxyHandle::start(listener, self.bind_ip, self.settings, self.statistics.clone()) {
                Ok(handle) => {
                    self.statistics.proxy_started();
                    self.bind_failing.remove(id);
                    info!("Forwarding {} -> {}", handle.bind_addr(), id);
                    self.proxies.insert(id.clone(), handle);
                    report.started.push(id.clone());
                }
                Err(e) => {
                    // 失敗が続いている間は最初の 1 回だけ数える
                    if self.bind_failing.insert(id.clone()) {
                        self.statistics.bind_failed();
                        warn!("Failed to start proxy for {}: {}", id, e);
                    } else {
                        debug!("Still unable to start proxy for {}: {}", id, e);
                    }
                    report.bind_failures.push((id.clone(), e));
                }
            }
        }

        if !report.started.is_empty() || !report.stopped.is_empty() {
            self.publish();
        }
        report
    }

    /// 全プロキシを停止し、リスナーが閉じられるまで待機
    pub async fn stop_all(&mut self) {
        let handles: Vec<ProxyHandle> = self.proxies.drain().map(|(_, handle)| handle).collect();
        if handles.is_empty() {
            return;
        }
        info!("Stopping {} proxies", handles.len());
        for handle in &handles {
            handle.stop();
            self.statistics.proxy_stopped();
        }
        for handle in handles {
            handle.wait_closed().await;
        }
        self.bind_failing.clear();
        self.publish();
    }

    fn publish(&self) {
        let mut summaries: Vec<ProxySummary> =
            self.proxies.values().map(ProxyHandle::summary).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        self.snapshot_tx.send_replace(summaries);
    }

    /// リコンサイルループを実行
    ///
    /// `shutdown` がキャンセルされると全プロキシを停止して `Ok(())` を返す。
    /// カーネル状態が読めない場合は全プロキシを停止してそのエラーを返す。
    pub async fn run<S: TcpStateSource>(
        mut self,
        source: S,
        shutdown: CancellationToken,
    ) -> Result<(), CollectorError> {
        let source = Arc::new(source);
        info!(
            "Reconciler started (bind: {}, interval: {:?})",
            self.bind_ip, self.poll_interval
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping reconciler");
                    break Ok(());
                }

                _ = ticker.tick() => {
                    // /proc の読み取りはブロッキング I/O なので専用スレッドで実行
                    let collector = source.clone();
                    let collected = tokio::task::spawn_blocking(move || collector.collect())
                        .await
                        .unwrap_or_else(|e| Err(CollectorError::TaskFailed(e.to_string())));
                    let records = match collected {
                        Ok(records) => records,
                        Err(e) => {
                            error!("Failed to read kernel TCP state: {}", e);
                            break Err(e);
                        }
                    };
                    let report = self.reconcile(&records);
                    if !report.is_empty() {
                        debug!(
                            "Tick: {} started, {} stopped, {} bind failures, {} live",
                            report.started.len(),
                            report.stopped.len(),
                            report.bind_failures.len(),
                            self.proxies.len()
                        );
                    }
                }
            }
        };

        self.stop_all().await;
        result
    }
}
