/// 客户端：本地监听 + 隧道转发
///
/// 每条本地 TCP 连接对应一次 `forward`：从会话池取一条到隧道服务器
/// 的逻辑流，然后在两端之间搬运字节直到任一侧结束
use crate::bridge::bridge;
use crate::config::ClientConfig;
use crate::pool::SessionPool;
use crate::transport::WssConnector;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info};

/// 运行隧道客户端，阻塞服务所有本地连接
pub async fn run_client(config: ClientConfig, tls_connector: TlsConnector) -> Result<()> {
    // URL 的合法性在启动时就确认，不留到第一次拨号才暴露
    config.validate().context("Invalid client configuration")?;

    let connector = WssConnector::new(
        tls_connector,
        Duration::from_secs(config.dial_timeout_secs),
    );
    let pool = Arc::new(SessionPool::new(
        Arc::new(connector),
        config.max_streams_per_session,
    ));

    let bind = format!("{}:{}", config.listen_addr, config.listen_port);
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;

    info!("Client listening on {}, tunneling to {}", bind, config.server_url);

    let remote = config.server_url.clone();
    loop {
        let (tcp, peer) = listener.accept().await.context("Listener failed")?;
        debug!("Accepted local connection from {}", peer);

        let pool = pool.clone();
        let remote = remote.clone();
        tokio::spawn(async move {
            if let Err(e) = forward(&pool, &remote, tcp).await {
                error!("Tunnel for {} failed: {}", peer, e);
            }
        });
    }
}

/// 为一条本地连接建立隧道并搬运字节
///
/// 获取流失败直接报错返回；搬运结束后两端随 Drop 关闭，
/// 这是一条隧道生命周期的唯一正常终点
pub async fn forward(pool: &SessionPool, remote: &str, mut tcp: TcpStream) -> Result<()> {
    let mut stream = pool.acquire(remote).await?;

    if let Err(e) = bridge(&mut tcp, &mut stream).await {
        debug!("Tunnel to {} ended with error: {}", remote, e);
    }
    Ok(())
}
