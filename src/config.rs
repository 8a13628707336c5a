use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 隧道固定路径（WebSocket 升级请求必须命中该路径）
pub const DEFAULT_TUNNEL_PATH: &str = "/tcp/";

/// 单会话并发流数的上限
///
/// yamux 对未被确认的出站流有 256 条的积压上限，打开第 257 条会
/// 无限期挂起；配置必须保持在该上限之内，打开流才总能及时完成
pub const MAX_STREAMS_PER_SESSION_LIMIT: usize = 255;

fn default_tunnel_path() -> String {
    DEFAULT_TUNNEL_PATH.to_string()
}

fn default_intake_capacity() -> usize {
    1024
}

fn default_max_streams() -> usize {
    10
}

fn default_dial_timeout_secs() -> u64 {
    10
}

/// 服务器端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 服务器监听地址
    pub bind_addr: String,
    /// 服务器监听端口
    pub bind_port: u16,
    /// 被转发的真实目标地址（host:port），每条隧道流都会拨号到这里
    pub forward_addr: String,
    /// TLS 证书路径
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// TLS 私钥路径
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// WebSocket 升级路径
    #[serde(default = "default_tunnel_path")]
    pub tunnel_path: String,
    /// 接收队列容量（队列满时新到的流被丢弃）
    #[serde(default = "default_intake_capacity")]
    pub intake_capacity: usize,
}

/// 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 本地监听地址
    pub listen_addr: String,
    /// 本地监听端口
    pub listen_port: u16,
    /// 隧道服务器 URL（例如 wss://relay.example.com:9443/tcp/）
    pub server_url: String,
    /// CA 证书路径（可选）
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// 是否跳过证书验证（仅用于测试）
    #[serde(default)]
    pub skip_verify: bool,
    /// 每个会话承载的最大并发流数，超过后创建新会话（上限 255）
    #[serde(default = "default_max_streams")]
    pub max_streams_per_session: usize,
    /// 拨号与握手的总超时（秒），握手完成后不再计时
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
}

impl ServerConfig {
    /// 验证配置的有效性
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_port == 0 {
            bail!("bind_port cannot be 0");
        }
        if self.forward_addr.trim().is_empty() {
            bail!("forward_addr cannot be empty");
        }
        if !self.tunnel_path.starts_with('/') {
            bail!("tunnel_path must start with '/'");
        }
        if self.intake_capacity == 0 {
            bail!("intake_capacity cannot be 0");
        }
        // 证书路径必须成对出现，或同时缺省（自动生成自签名证书）
        match (&self.cert_path, &self.key_path) {
            (Some(_), Some(_)) | (None, None) => Ok(()),
            _ => bail!("cert_path and key_path must both be set, or both omitted to auto-generate"),
        }
    }
}

impl ClientConfig {
    /// 验证配置的有效性
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listen_port == 0 {
            bail!("listen_port cannot be 0");
        }
        if self.max_streams_per_session == 0 {
            bail!("max_streams_per_session cannot be 0");
        }
        if self.max_streams_per_session > MAX_STREAMS_PER_SESSION_LIMIT {
            bail!(
                "max_streams_per_session cannot exceed {}",
                MAX_STREAMS_PER_SESSION_LIMIT
            );
        }
        if self.dial_timeout_secs == 0 {
            bail!("dial_timeout_secs cannot be 0");
        }

        let url = url::Url::parse(&self.server_url)
            .with_context(|| format!("Invalid server_url: {}", self.server_url))?;
        if url.scheme() != "wss" {
            bail!("server_url must use the wss:// scheme, got '{}'", url.scheme());
        }
        if url.host_str().is_none() {
            bail!("server_url must contain a host");
        }
        Ok(())
    }
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum AppConfig {
    Server(ServerConfig),
    Client(ClientConfig),
}

impl AppConfig {
    /// 从文件加载配置（自动检测类型）
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let config: AppConfig = toml::from_str(&content).context("Failed to parse configuration")?;

        match &config {
            AppConfig::Server(c) => c.validate().context("Server configuration validation failed")?,
            AppConfig::Client(c) => c.validate().context("Client configuration validation failed")?,
        }

        Ok(config)
    }

    /// 从文件加载服务器配置
    pub fn load_server_config(path: &str) -> anyhow::Result<ServerConfig> {
        #[derive(Deserialize)]
        struct ServerConfigWrapper {
            server: ServerConfig,
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let wrapper: ServerConfigWrapper =
            toml::from_str(&content).context("Failed to parse server configuration")?;
        wrapper
            .server
            .validate()
            .context("Server configuration validation failed")?;
        Ok(wrapper.server)
    }

    /// 从文件加载客户端配置
    pub fn load_client_config(path: &str) -> anyhow::Result<ClientConfig> {
        #[derive(Deserialize)]
        struct ClientConfigWrapper {
            client: ClientConfig,
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let wrapper: ClientConfigWrapper =
            toml::from_str(&content).context("Failed to parse client configuration")?;
        wrapper
            .client
            .validate()
            .context("Client configuration validation failed")?;
        Ok(wrapper.client)
    }
}
