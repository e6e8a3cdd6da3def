//! loopfwd - loopback listener forwarding agent
//!
//! コンテナ内でループバックアドレスにだけ bind されたサービスを、
//! コンテナの外部向けアドレスから到達できるようにするエージェントです。
//!
//! # 主要コンポーネント
//!
//! - [`tcp_state`] - `/proc/net/tcp{,6}` の読み取りとパース
//! - [`desired`] - 転送対象（ループバックの LISTEN ソケット）の導出
//! - [`reconciler`] - 転送対象と稼働中プロキシの差分適用
//! - [`proxy`] - プロキシのライフサイクル管理（listen / accept / 停止）
//! - [`forwarder`] - 接続の双方向中継
//! - [`api`] - HTTP API サーバー（ヘルスチェック、メトリクス、プロキシ一覧）
//!
//! # アーキテクチャ
//!
//! ```text
//! /proc/net/tcp{,6} → [tcp_state] → [desired] → [reconciler] → [proxy] × N
//!                                                                  │
//! [外部クライアント] ─TCP→ <bind_addr>:<port> ─[forwarder]→ 127.0.0.1:<port>
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use loopfwd::config::AgentConfig;
//! use loopfwd::reconciler::Reconciler;
//! use loopfwd::statistics::AgentStatistics;
//! use loopfwd::tcp_state::ProcNetTcp;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AgentConfig::default();
//!     let reconciler = Reconciler::new(&config, Arc::new(AgentStatistics::new()));
//!     reconciler
//!         .run(ProcNetTcp::new(&config.proc_root), CancellationToken::new())
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod desired;
pub mod forwarder;
pub mod proxy;
pub mod reconciler;
pub mod statistics;
pub mod tcp_state;

// 便利な再エクスポート
pub use config::AgentConfig;
pub use reconciler::Reconciler;
