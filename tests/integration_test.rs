//! loopfwd 統合テスト
//!
//! 実際のバイナリを起動し、ホストのカーネル TCP テーブルに対してエンドツーエンドで確認します:
//! - ループバックのリスナー出現でプロキシが起動し、双方向に中継される
//! - リスナー消失でプロキシが停止する
//! - ステータス API
//! - SIGTERM によるグレースフルシャットダウン
//! - カーネル状態が読めない場合の異常終了
//!
//! プロキシは 127.0.0.2 に bind します（Linux では 127.0.0.0/8 全体が lo に割り当てられている）。

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// プロキシの bind アドレス
const PROXY_IP: &str = "127.0.0.2";

/// テスト用の一意なポート番号を取得
fn get_test_port() -> u16 {
    portpicker::pick_unused_port().expect("No available port")
}

/// loopfwd バイナリへのパス
fn loopfwd_binary() -> &'static str {
    env!("CARGO_BIN_EXE_loopfwd")
}

/// 条件が満たされるまで待機
fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

fn can_connect(addr: &str) -> bool {
    let addr: SocketAddr = addr.parse().expect("invalid address");
    TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok()
}

/// 簡易 HTTP クライアント（レスポンス全体を返す）
fn http_request(addr: &str, method: &str, path: &str, body: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    write!(
        stream,
        "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        body.len(),
        body
    )?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    Ok(response)
}

/// loopfwd エージェントを起動するヘルパー
struct TestAgent {
    process: Child,
    api_addr: String,
}

impl TestAgent {
    fn start() -> Self {
        let api_addr = format!("127.0.0.1:{}", get_test_port());
        eprintln!("[TestAgent] Starting: bind={}, api={}", PROXY_IP, api_addr);

        let process = Command::new(loopfwd_binary())
            .args([
                "--bind-addr",
                PROXY_IP,
                "--poll-interval-ms",
                "20",
                "--api-listen",
                &api_addr,
            ])
            .env("RUST_LOG", "loopfwd=debug")
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .expect("Failed to start loopfwd");

        let agent = Self { process, api_addr };
        assert!(
            wait_until(Duration::from_secs(10), || can_connect(&agent.api_addr)),
            "API server did not become available"
        );
        agent
    }

    fn api(&self, method: &str, path: &str, body: &str) -> String {
        http_request(&self.api_addr, method, path, body).expect("API request failed")
    }

    fn send_sigterm(&self) {
        unsafe {
            libc::kill(self.process.id() as i32, libc::SIGTERM);
        }
    }

    fn wait_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Ok(Some(status)) = self.process.try_wait() {
                return Some(status);
            }
            thread::sleep(Duration::from_millis(50));
        }
        None
    }
}

impl Drop for TestAgent {
    fn drop(&mut self) {
        if let Ok(None) = self.process.try_wait() {
            self.send_sigterm();
            if self.wait_exit(Duration::from_secs(5)).is_none() {
                let _ = self.process.kill();
            }
        }
        let _ = self.process.wait();
    }
}

/// ループバックにだけ bind するエコーサーバー
///
/// drop するとリスナーを閉じる。
struct EchoService {
    port: u16,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EchoService {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind echo service");
        listener
            .set_nonblocking(true)
            .expect("Failed to set non-blocking mode");
        let port = listener.local_addr().unwrap().port();
        let stop = Arc::new(AtomicBool::new(false));

        let flag = stop.clone();
        let thread = thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        thread::spawn(move || {
                            let _ = stream.set_nonblocking(false);
                            let mut buf = [0u8; 8192];
                            loop {
                                match stream.read(&mut buf) {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        if stream.write_all(&buf[..n]).is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        });
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
            // listener はここで drop される
        });

        Self {
            port,
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for EchoService {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ============================================================================
// エンドツーエンド
// ============================================================================

#[test]
#[cfg(target_os = "linux")]
fn test_loopback_listener_is_forwarded_and_withdrawn() {
    let mut agent = TestAgent::start();

    // 1. ループバックだけで listen するサービスを起動
    let service = EchoService::start();
    let proxy_addr = format!("{}:{}", PROXY_IP, service.port);

    // 2. プロキシが現れるまで待機
    assert!(
        wait_until(Duration::from_secs(10), || can_connect(&proxy_addr)),
        "Proxy for {} did not appear",
        proxy_addr
    );

    // 3. 外部アドレス経由で双方向に中継される
    let mut client = TcpStream::connect(&proxy_addr).expect("Failed to connect to proxy");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"Hello through loopfwd").unwrap();
    let mut buf = [0u8; 21];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"Hello through loopfwd");

    // 4. ListProxies に現れる
    let response = agent.api("POST", "/api/v1/ListProxies", "{}");
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(
        response.contains(&format!("\"id\":\"127.0.0.1:{}\"", service.port)),
        "{}",
        response
    );
    assert!(response.contains(&format!("\"bind_addr\":\"{}\"", proxy_addr)));

    // 5. リスナーが消えるとプロキシも消える
    drop(client);
    let port = service.port;
    drop(service);
    assert!(
        wait_until(Duration::from_secs(10), || !can_connect(&proxy_addr)),
        "Proxy for {} was not withdrawn",
        proxy_addr
    );
    let response = agent.api("POST", "/api/v1/ListProxies", "{}");
    assert!(!response.contains(&format!("\"id\":\"127.0.0.1:{}\"", port)));

    // 6. メトリクス
    let response = agent.api("GET", "/metrics", "");
    assert!(response.contains("# TYPE loopfwd_proxies_started_total counter"));
    assert!(!response.contains("loopfwd_proxies_started_total 0\n"));
    assert!(!response.contains("loopfwd_connections_total 0\n"));

    let response = agent.api("GET", "/healthcheck", "");
    assert!(response.contains(r#"{"status":"SERVING"}"#));

    // 7. SIGTERM で正常終了
    agent.send_sigterm();
    let status = agent
        .wait_exit(Duration::from_secs(10))
        .expect("loopfwd did not exit after SIGTERM");
    assert!(status.success(), "unexpected exit status: {:?}", status);
    assert!(!can_connect(&agent.api_addr));
}

#[test]
#[cfg(target_os = "linux")]
fn test_unreadable_kernel_state_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing");

    let status = Command::new(loopfwd_binary())
        .args(["--bind-addr", PROXY_IP, "--proc-root"])
        .arg(&missing)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("Failed to run loopfwd");
    assert!(!status.success());
}

#[test]
fn test_print_config() {
    let output = Command::new(loopfwd_binary())
        .args(["--print-config", "--poll-interval-ms", "25", "--exclude-port", "22,80"])
        .output()
        .expect("Failed to run loopfwd");
    assert!(output.status.success());

    let config: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("config is not JSON");
    assert_eq!(config["bind_addr"], "172.20.0.2");
    assert_eq!(config["poll_interval_ms"], 25);
    assert_eq!(config["dial_timeout_ms"], 5000);
    assert_eq!(config["excluded_ports"], serde_json::json!([22, 80]));
}
