/// 服务器端：监听、升级、派发
///
/// 外层 accept 循环由退避监督器包裹；每条入站连接升级为一个多路复用
/// 会话并由独立任务接受其逻辑流，所有流汇入同一个有界接收队列，
/// 队列满时直接丢弃最新的流（这是接收与消费之间唯一的背压手段）
use crate::bridge::bridge;
use crate::config::ServerConfig;
use crate::mux::{MuxSession, MuxStream};
use crate::transport::WssAcceptor;
use anyhow::{Context, Result};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::sleep;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// 退避起始延迟
const BACKOFF_BASE: Duration = Duration::from_millis(5);
/// 退避延迟上限
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// 有界接收队列
///
/// 生产者（各连接的接受循环）永不阻塞：入队失败即关闭该流并计数
#[derive(Clone)]
pub struct IntakeQueue {
    tx: mpsc::Sender<MuxStream>,
    dropped: Arc<AtomicU64>,
}

impl IntakeQueue {
    /// 创建固定容量的队列，返回生产者句柄与唯一的消费端
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MuxStream>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// 非阻塞入队；队列满时丢弃该流
    pub fn publish(&self, stream: MuxStream) {
        match self.tx.try_send(stream) {
            Ok(()) => {}
            Err(TrySendError::Full(stream)) => {
                drop(stream);
                let total = self.dropped.fetch_add(1, Ordering::SeqCst) + 1;
                warn!("Intake queue full, dropping stream (total dropped: {})", total);
            }
            Err(TrySendError::Closed(stream)) => {
                drop(stream);
                warn!("Intake consumer is gone, dropping stream");
            }
        }
    }

    /// 因队列满而被丢弃的流总数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

/// accept 循环的指数退避
///
/// 连续的瞬时错误使延迟从起始值逐次翻倍、封顶于上限；
/// 任何一次成功都把延迟清零
pub struct AcceptBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl AcceptBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: Duration::ZERO,
        }
    }

    /// 下一次重试前应等待的时长
    pub fn next_delay(&mut self) -> Duration {
        self.current = if self.current.is_zero() {
            self.base
        } else {
            (self.current * 2).min(self.max)
        };
        self.current
    }

    /// 成功后清零
    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}

impl Default for AcceptBackoff {
    fn default() -> Self {
        Self::new(BACKOFF_BASE, BACKOFF_MAX)
    }
}

/// 判断 accept 错误是否可通过退避重试恢复
fn is_transient_accept_error(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    // 文件描述符耗尽（EMFILE/ENFILE）也按瞬时错误处理
    matches!(e.raw_os_error(), Some(23) | Some(24))
}

/// 运行隧道服务器，阻塞直到发生致命的监听错误
pub async fn run_server(config: ServerConfig, tls_acceptor: TlsAcceptor) -> Result<()> {
    let bind = format!("{}:{}", config.bind_addr, config.bind_port);
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;

    info!(
        "Server listening on {} (tunnel path '{}', forwarding to {})",
        bind, config.tunnel_path, config.forward_addr
    );

    let (intake, intake_rx) = IntakeQueue::new(config.intake_capacity);
    tokio::spawn(consume_intake(intake_rx, config.forward_addr.clone()));

    let acceptor = Arc::new(WssAcceptor::new(tls_acceptor, config.tunnel_path.clone()));

    let mut backoff = AcceptBackoff::default();
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                backoff.reset();
                let acceptor = acceptor.clone();
                let intake = intake.clone();
                tokio::spawn(async move {
                    handle_connection(stream, peer, acceptor, intake).await;
                });
            }
            Err(e) if is_transient_accept_error(&e) => {
                let delay = backoff.next_delay();
                warn!("Accept error: {}; retrying in {:?}", e, delay);
                sleep(delay).await;
            }
            Err(e) => {
                error!("Fatal accept error: {}", e);
                return Err(e).context("Listener failed");
            }
        }
    }
}

/// 处理一条入站安全连接：升级、建会话、接受流并发布到接收队列
///
/// 这里的失败只影响该连接本身，监听循环与其他连接不受影响
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Arc<WssAcceptor>,
    intake: IntakeQueue,
) {
    let io = match acceptor.upgrade(stream).await {
        Ok(io) => io,
        Err(e) => {
            warn!("Upgrade failed for {}: {}", peer, e);
            return;
        }
    };

    let session = MuxSession::server(io);
    info!("Session established with {}", peer);

    while let Some(stream) = session.accept_stream().await {
        intake.publish(stream);
    }

    // 接受循环只在多路复用层报告终止时结束；关闭会话释放其余流
    session.close();
    info!("Session ended with {}", peer);
}

/// 接收队列的唯一消费者：为每条流拨号真实目标并搬运字节
async fn consume_intake(mut rx: mpsc::Receiver<MuxStream>, forward_addr: String) {
    while let Some(mut stream) = rx.recv().await {
        let addr = forward_addr.clone();
        tokio::spawn(async move {
            match TcpStream::connect(&addr).await {
                Ok(mut tcp) => {
                    if let Err(e) = bridge(&mut stream, &mut tcp).await {
                        debug!("Tunnel to {} ended with error: {}", addr, e);
                    }
                }
                Err(e) => {
                    warn!("Failed to dial forward destination {}: {}", addr, e);
                }
            }
        });
    }
    debug!("Intake consumer stopped");
}
