//! 接続の中継
//!
//! 外部から受け付けた TCP 接続と、ループバック上のサービスへの TCP 接続の間で
//! バイト列を双方向に中継します。プロトコルは解釈しません。

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::statistics::AgentStatistics;

/// 中継バッファサイズ
const RELAY_BUFFER_SIZE: usize = 8192;

/// 転送方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// 外部 → ループバック
    ToLocal,
    /// ループバック → 外部
    ToExternal,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ToLocal => write!(f, "external->local"),
            Direction::ToExternal => write!(f, "local->external"),
        }
    }
}

/// 2 本の接続間でデータを中継
///
/// 方向ごとに独立したタスクでコピーし、どちらかが終了（EOF またはエラー）した時点で
/// もう一方を中断して両方の接続を閉じる。エラーはログに出すだけで呼び出し元には返さない。
pub async fn forward(
    conn_id: u64,
    external: TcpStream,
    local: TcpStream,
    statistics: Arc<AgentStatistics>,
) {
    debug!("[{}] Starting relay", conn_id);
    statistics.connection_opened();

    let (external_read, external_write) = external.into_split();
    let (local_read, local_write) = local.into_split();

    let mut to_local = tokio::spawn(pump(
        conn_id,
        Direction::ToLocal,
        external_read,
        local_write,
        statistics.clone(),
    ));
    let mut to_external = tokio::spawn(pump(
        conn_id,
        Direction::ToExternal,
        local_read,
        external_write,
        statistics.clone(),
    ));

    // 先に終わった方向の結果を記録し、残りを中断する
    // abort されたタスクが保持していたハーフも drop され、ソケットが閉じられる
    let (finished, result) = tokio::select! {
        result = &mut to_local => {
            to_external.abort();
            (Direction::ToLocal, result)
        }
        result = &mut to_external => {
            to_local.abort();
            (Direction::ToExternal, result)
        }
    };

    match result {
        Ok(Ok(bytes)) => debug!("[{}] {} reached EOF after {} bytes", conn_id, finished, bytes),
        Ok(Err(e)) => debug!("[{}] {} failed: {}", conn_id, finished, e),
        Err(e) => debug!("[{}] {} task error: {}", conn_id, finished, e),
    }

    // 中断したタスクの終了（= ハーフの解放）を待つ
    match finished {
        Direction::ToLocal => {
            let _ = to_external.await;
        }
        Direction::ToExternal => {
            let _ = to_local.await;
        }
    }

    statistics.connection_closed();
    debug!("[{}] Relay completed", conn_id);
}

/// 片方向のコピー
///
/// 読み取り側が EOF に達したら書き込み側を shutdown して終了する。
async fn pump<R, W>(
    conn_id: u64,
    direction: Direction,
    mut reader: R,
    mut writer: W,
    statistics: Arc<AgentStatistics>,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            debug!("[{}] {} read EOF", conn_id, direction);
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
        match direction {
            Direction::ToLocal => statistics.add_bytes_to_local(n as u64),
            Direction::ToExternal => statistics.add_bytes_to_external(n as u64),
        }
    }
    let _ = writer.shutdown().await;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// 接続済みの TCP ペアを作成
    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_forward_is_symmetric() {
        // peer <-> [external | forwarder | local] <-> service
        let (mut peer, external) = tcp_pair().await;
        let (local, mut service) = tcp_pair().await;
        let stats = Arc::new(AgentStatistics::new());

        let relay = tokio::spawn(forward(1, external, local, stats.clone()));

        peer.write_all(b"hello from outside").await.unwrap();
        let mut buf = [0u8; 18];
        service.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from outside");

        service.write_all(b"hello from loopback").await.unwrap();
        let mut buf = [0u8; 19];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from loopback");

        // 外部側が閉じたら中継全体が終了する
        drop(peer);
        tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .expect("relay did not finish")
            .unwrap();

        // サービス側も EOF を受け取る
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), service.read_to_end(&mut rest))
            .await
            .expect("service side was not closed")
            .unwrap_or(0);
        assert_eq!(n, 0);

        assert_eq!(stats.bytes_to_local(), 18);
        assert_eq!(stats.bytes_to_external(), 19);
        assert_eq!(stats.connections_total(), 1);
        assert_eq!(stats.connections_active(), 0);
    }

    #[tokio::test]
    async fn test_local_close_closes_external() {
        let (mut peer, external) = tcp_pair().await;
        let (local, service) = tcp_pair().await;
        let stats = Arc::new(AgentStatistics::new());

        let relay = tokio::spawn(forward(2, external, local, stats));

        // サービス側が閉じる
        drop(service);
        tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .expect("relay did not finish")
            .unwrap();

        let mut rest = Vec::new();
        let result = tokio::time::timeout(Duration::from_secs(5), peer.read_to_end(&mut rest))
            .await
            .expect("external side was not closed");
        // EOF もしくは RST のどちらでも閉じたと見なす
        if let Ok(n) = result {
            assert_eq!(n, 0);
        }
    }
}
