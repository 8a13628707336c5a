/// 集成测试公共辅助
use std::net::TcpListener as StdTcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

static CERT_SEQ: AtomicU32 = AtomicU32::new(0);

/// 取一个当前空闲的端口
pub fn get_available_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("Failed to bind to find free port");
    listener.local_addr().unwrap().port()
}

/// 生成一对临时自签名证书文件
pub fn generate_test_certs() -> (PathBuf, PathBuf) {
    let seq = CERT_SEQ.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir();
    let cert_path = dir.join(format!("mwss-relay-test-{}-{}-cert.pem", std::process::id(), seq));
    let key_path = dir.join(format!("mwss-relay-test-{}-{}-key.pem", std::process::id(), seq));

    mwss_relay::tls::generate_self_signed_cert(
        "localhost",
        &["localhost".to_string(), "127.0.0.1".to_string()],
        &cert_path,
        &key_path,
    )
    .expect("Failed to generate test certificates");

    (cert_path, key_path)
}

/// 测试结束时清理证书文件
pub struct TestCleanup {
    paths: Vec<PathBuf>,
}

impl TestCleanup {
    pub fn new(cert: PathBuf, key: PathBuf) -> Self {
        Self {
            paths: vec![cert, key],
        }
    }
}

impl Drop for TestCleanup {
    fn drop(&mut self) {
        for path in &self.paths {
            std::fs::remove_file(path).ok();
        }
    }
}

/// 启动一个回显服务器
pub async fn start_echo_server(port: u16) -> tokio::task::JoinHandle<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind echo server");

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };

            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }
    })
}
