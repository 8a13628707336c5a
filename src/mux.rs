/// 多路复用会话封装
///
/// 每个会话独占一条安全帧传输连接，由一个专属驱动任务轮询 yamux
/// 连接：出站流通过命令通道申请，入站流（服务器模式）交给
/// `accept_stream` 的消费者。驱动任务退出即视为会话关闭
use crate::error::{RelayError, Result};
use futures::future::poll_fn;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::debug;
use yamux::{Config as YamuxConfig, Connection as YamuxConnection, Mode};

/// 驱动任务的命令
enum Command {
    /// 打开一个新的出站流，结果通过 oneshot 返回
    Open(oneshot::Sender<std::result::Result<yamux::Stream, yamux::ConnectionError>>),
    /// 主动关闭会话
    Close,
}

/// 多路复用会话
///
/// 会话关闭后 `is_closed()` 返回 true、`open_stream()` 返回
/// `SessionClosed`；调用方无需区分"从未初始化"与"已关闭"
pub struct MuxSession {
    cmd_tx: mpsc::Sender<Command>,
    accept_rx: Mutex<mpsc::Receiver<MuxStream>>,
    closed: Arc<AtomicBool>,
    num_streams: Arc<AtomicUsize>,
    max_streams: usize,
}

impl MuxSession {
    /// 在已建立的传输连接上创建客户端会话
    pub fn client<T>(io: T, max_streams: usize) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(io, Mode::Client, max_streams)
    }

    /// 在已升级的入站连接上创建服务器会话（不限制流数量，由对端的池负责）
    pub fn server<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(io, Mode::Server, usize::MAX)
    }

    fn spawn<T>(io: T, mode: Mode, max_streams: usize) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let conn = YamuxConnection::new(io.compat(), YamuxConfig::default(), mode);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        // 容量为 1：接受的流同步地交给派发循环，不在会话内堆积
        let (accept_tx, accept_rx) = mpsc::channel(1);
        let closed = Arc::new(AtomicBool::new(false));
        let num_streams = Arc::new(AtomicUsize::new(0));

        // 客户端永远不接受入站流，驱动任务直接丢弃它们
        let accept_tx = match mode {
            Mode::Server => Some(accept_tx),
            Mode::Client => None,
        };

        tokio::spawn(drive(
            conn,
            cmd_rx,
            accept_tx,
            closed.clone(),
            num_streams.clone(),
        ));

        Self {
            cmd_tx,
            accept_rx: Mutex::new(accept_rx),
            closed,
            num_streams,
            max_streams,
        }
    }

    /// 打开一个新的逻辑流
    ///
    /// 失败意味着会话已不可用，调用方应关闭并丢弃整个会话
    pub async fn open_stream(&self) -> Result<MuxStream> {
        if self.is_closed() {
            return Err(RelayError::SessionClosed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Open(reply_tx))
            .await
            .map_err(|_| RelayError::SessionClosed)?;

        let stream = reply_rx
            .await
            .map_err(|_| RelayError::SessionClosed)??;

        Ok(MuxStream::new(stream, self.num_streams.clone()))
    }

    /// 接受对端打开的逻辑流；会话终止后返回 None
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        self.accept_rx.lock().await.recv().await
    }

    /// 主动关闭会话，释放其上所有仍打开的流
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.try_send(Command::Close);
    }

    /// 会话是否已终止
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 当前活跃的逻辑流数量
    pub fn num_streams(&self) -> usize {
        self.num_streams.load(Ordering::SeqCst)
    }

    /// 配置的最大并发流数
    pub fn max_streams(&self) -> usize {
        self.max_streams
    }
}

/// 会话驱动循环
///
/// yamux 连接必须被持续轮询才能处理帧与 keepalive，因此由独立任务
/// 持有连接；任何终止条件（对端关闭、传输断开、主动 Close）都会
/// 置位 closed 并结束任务
async fn drive<T>(
    mut conn: YamuxConnection<T>,
    mut cmd_rx: mpsc::Receiver<Command>,
    accept_tx: Option<mpsc::Sender<MuxStream>>,
    closed: Arc<AtomicBool>,
    num_streams: Arc<AtomicUsize>,
) where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Open(reply)) => {
                    let result = poll_fn(|cx| conn.poll_new_outbound(cx)).await;
                    let failed = result.is_err();
                    if reply.send(result).is_err() {
                        debug!("Open-stream caller went away");
                    }
                    if failed {
                        break;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = poll_fn(|cx| conn.poll_close(cx)).await;
                    break;
                }
            },
            inbound = poll_fn(|cx| conn.poll_next_inbound(cx)) => match inbound {
                Some(Ok(stream)) => match &accept_tx {
                    Some(tx) => {
                        let wrapped = MuxStream::new(stream, num_streams.clone());
                        if tx.send(wrapped).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        debug!("Dropping unexpected inbound stream on client session");
                        drop(stream);
                    }
                },
                Some(Err(e)) => {
                    debug!("Session terminated: {}", e);
                    break;
                }
                None => {
                    debug!("Session closed by peer");
                    break;
                }
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
}

/// 单个逻辑流
///
/// 实现 tokio 的 `AsyncRead + AsyncWrite`；在存续期间占用所属会话的
/// 流配额，Drop 时自动归还。关闭流不影响会话本身
pub struct MuxStream {
    inner: Compat<yamux::Stream>,
    counter: Arc<AtomicUsize>,
}

impl MuxStream {
    fn new(stream: yamux::Stream, counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: stream.compat(),
            counter,
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
