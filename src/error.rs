/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，替代泛型的 anyhow::Error
/// 这样可以让调用者区分拨号失败、流打开失败和会话关闭等情况
use std::io;
use thiserror::Error;

/// MWSS Relay 的主要错误类型
#[derive(Error, Debug)]
pub enum RelayError {
    /// 拨号失败（TCP 连接阶段）
    #[error("Failed to dial {addr}: {source}")]
    DialFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 安全握手失败（TLS 或 WebSocket 升级阶段）
    #[error("Handshake with {addr} failed: {reason}")]
    HandshakeFailed { addr: String, reason: String },

    /// 多路复用层错误
    #[error("Multiplexer error: {0}")]
    Mux(#[from] yamux::ConnectionError),

    /// 会话已关闭，无法再打开新的流
    #[error("Session is closed")]
    SessionClosed,

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// 创建拨号失败错误
    pub fn dial_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::DialFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建握手失败错误
    pub fn handshake_failed(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            addr: addr.into(),
            reason: reason.into(),
        }
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 检查是否为会话关闭错误
    pub fn is_session_closed(&self) -> bool {
        matches!(self, Self::SessionClosed)
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }
}
