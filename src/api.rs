//! ステータス API サーバー
//!
//! エージェントの状態をローカルから確認するための HTTP API を提供します。
//! 管理用エンドポイントは POST メソッドを使用する RPC スタイルです。
//!
//! ### エンドポイント
//!
//! | メソッド | 説明 |
//! |----------|------|
//! | `GET /healthcheck` | ヘルスチェック |
//! | `GET /metrics` | Prometheus 形式のメトリクス |
//! | `POST /api/v1/ListProxies` | 稼働中プロキシの一覧 |

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::proxy::ProxySummary;
use crate::statistics::AgentStatistics;

/// API パス
pub mod api_paths {
    pub const HEALTHCHECK: &str = "/healthcheck";
    pub const METRICS: &str = "/metrics";
    pub const LIST_PROXIES: &str = "/api/v1/ListProxies";
}

// =============================================================================
// API 状態
// =============================================================================

/// API サーバーの状態
#[derive(Clone)]
pub struct ApiState {
    pub statistics: Arc<AgentStatistics>,
    /// リコンサイラが公開するプロキシ一覧
    pub proxies: watch::Receiver<Vec<ProxySummary>>,
}

#[derive(Serialize)]
struct HealthCheckResponse {
    status: &'static str,
}

/// ListProxies リクエスト（現状パラメータなし）
#[derive(Debug, Default, Deserialize)]
pub struct ListProxiesRequest {}

#[derive(Debug, Serialize)]
pub struct ListProxiesResponse {
    pub proxies: Vec<ProxySummary>,
}

// =============================================================================
// API ハンドラー
// =============================================================================

/// GET /healthcheck
async fn healthcheck() -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse { status: "SERVING" })
}

/// GET /metrics
async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.statistics.to_prometheus(),
    )
}

/// POST /api/v1/ListProxies
async fn list_proxies(
    State(state): State<ApiState>,
    Json(_req): Json<ListProxiesRequest>,
) -> Json<ListProxiesResponse> {
    let proxies = state.proxies.borrow().clone();
    debug!("ListProxies: {} proxies", proxies.len());
    Json(ListProxiesResponse { proxies })
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(api_paths::HEALTHCHECK, get(healthcheck))
        .route(api_paths::METRICS, get(metrics))
        .route(api_paths::LIST_PROXIES, post(list_proxies))
        .with_state(state)
}

/// bind 済みのリスナーで API を提供
///
/// `shutdown` がキャンセルされるとグレースフルに終了する。
pub async fn serve(listener: TcpListener, state: ApiState, shutdown: CancellationToken) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("API server failed")?;
    Ok(())
}
