/// WSS 传输：TLS 之上承载 WebSocket 升级
///
/// 客户端在固定超时内完成 TCP 拨号、TLS 握手与 WebSocket 升级；
/// 握手完成后不再设置超时，存活性由多路复用层的 keepalive 负责
use super::{Connector, Transport, WsIo};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use std::pin::Pin;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, warn};
use url::Url;

/// Keepalive 首次探测时间
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);
/// Keepalive 探测间隔
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// 客户端 WSS 拨号器
///
/// 本身不绑定目标：每次拨号按传入的隧道 URL 解析主机与端口，
/// 同一个拨号器可服务会话池中的任意地址
pub struct WssConnector {
    tls_connector: TlsConnector,
    dial_timeout: Duration,
}

impl WssConnector {
    pub fn new(tls_connector: TlsConnector, dial_timeout: Duration) -> Self {
        Self {
            tls_connector,
            dial_timeout,
        }
    }

    async fn establish(&self, addr: &str) -> Result<Pin<Box<dyn Transport>>> {
        let (url, host, port) = parse_endpoint(addr)?;
        let hostport = format!("{}:{}", host, port);

        let tcp_stream = TcpStream::connect(&hostport)
            .await
            .map_err(|e| RelayError::dial_failed(&hostport, e))?;
        apply_keepalive(&tcp_stream);

        let server_name = ServerName::try_from(host)
            .map_err(|e| RelayError::config_error(format!("Invalid server name: {}", e)))?;

        let tls_stream = self
            .tls_connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| RelayError::handshake_failed(&hostport, format!("TLS handshake: {}", e)))?;

        let (ws, _response) = tokio_tungstenite::client_async(url.as_str(), tls_stream)
            .await
            .map_err(|e| {
                RelayError::handshake_failed(url.as_str(), format!("WebSocket upgrade: {}", e))
            })?;

        debug!("Established WSS connection to {}", url);
        Ok(Box::pin(WsIo::new(ws)))
    }
}

#[async_trait]
impl Connector for WssConnector {
    async fn connect(&self, addr: &str) -> Result<Pin<Box<dyn Transport>>> {
        // 拨号与握手在同一个超时窗口内完成，超时后整个连接作废
        match tokio::time::timeout(self.dial_timeout, self.establish(addr)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::timeout(self.dial_timeout)),
        }
    }
}

/// 解析隧道 URL，得到 WebSocket 升级用的 URL 与 TCP 拨号用的主机端口
fn parse_endpoint(addr: &str) -> Result<(Url, String, u16)> {
    let url = Url::parse(addr)
        .map_err(|e| RelayError::config_error(format!("Invalid server URL: {}", e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| RelayError::config_error("Server URL has no host"))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| RelayError::config_error("Server URL has no port"))?;
    Ok((url, host, port))
}

/// 服务器端 WSS 升级器
pub struct WssAcceptor {
    tls_acceptor: TlsAcceptor,
    tunnel_path: String,
}

impl WssAcceptor {
    pub fn new(tls_acceptor: TlsAcceptor, tunnel_path: impl Into<String>) -> Self {
        Self {
            tls_acceptor,
            tunnel_path: tunnel_path.into(),
        }
    }

    /// 将入站 TCP 连接升级为安全帧传输连接
    pub async fn upgrade(&self, stream: TcpStream) -> Result<Pin<Box<dyn Transport>>> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let tls_stream = self
            .tls_acceptor
            .accept(stream)
            .await
            .map_err(|e| RelayError::handshake_failed(&peer, format!("TLS handshake: {}", e)))?;

        let tunnel_path = self.tunnel_path.clone();
        let callback = move |req: &Request, resp: Response| {
            if path_allowed(req.uri().path(), &tunnel_path) {
                Ok(resp)
            } else {
                let mut resp = ErrorResponse::new(Some("not found".to_string()));
                *resp.status_mut() = StatusCode::NOT_FOUND;
                Err(resp)
            }
        };

        let ws = tokio_tungstenite::accept_hdr_async(tls_stream, callback)
            .await
            .map_err(|e| {
                RelayError::handshake_failed(&peer, format!("WebSocket upgrade: {}", e))
            })?;

        debug!("Upgraded inbound connection from {}", peer);
        Ok(Box::pin(WsIo::new(ws)))
    }
}

/// 检查请求路径是否命中隧道路径
fn path_allowed(request_path: &str, tunnel_path: &str) -> bool {
    let trimmed = tunnel_path.trim_end_matches('/');
    request_path == tunnel_path || request_path == trimmed || request_path.starts_with(tunnel_path)
}

fn apply_keepalive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);

    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(
            "Failed to set TCP keepalive on {}: {}",
            stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into()),
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_allowed() {
        assert!(path_allowed("/tcp/", "/tcp/"));
        assert!(path_allowed("/tcp", "/tcp/"));
        assert!(path_allowed("/tcp/extra", "/tcp/"));
        assert!(!path_allowed("/", "/tcp/"));
        assert!(!path_allowed("/udp/", "/tcp/"));
    }

    #[test]
    fn test_parse_endpoint_rejects_bad_url() {
        let err = parse_endpoint("not a url").err().unwrap();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_parse_endpoint_default_port() {
        let (_, host, port) = parse_endpoint("wss://relay.example.com/tcp/").unwrap();
        assert_eq!(host, "relay.example.com");
        assert_eq!(port, 443);
    }

    #[tokio::test]
    async fn test_connect_surfaces_bad_url_per_dial() {
        let tls = crate::tls::load_client_config(None, true).unwrap();
        let connector = WssConnector::new(TlsConnector::from(tls), Duration::from_secs(5));

        let err = connector.connect("not a url").await.err().unwrap();
        assert!(err.is_config_error());
    }
}
