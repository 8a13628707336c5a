mod ws;
mod wss;

pub use ws::WsIo;
pub use wss::{WssAcceptor, WssConnector};

use crate::error::Result;
use async_trait::async_trait;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// 传输层连接抽象
///
/// 统一封装安全帧传输（TLS + WebSocket）建立出的双工连接
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 客户端拨号接口
///
/// 会话池通过该接口建立新的底层连接，测试可以注入内存实现
#[async_trait]
pub trait Connector: Send + Sync {
    /// 拨号到指定隧道地址并完成安全握手，返回可承载多路复用会话的
    /// 双工连接
    async fn connect(&self, addr: &str) -> Result<Pin<Box<dyn Transport>>>;
}
