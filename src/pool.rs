/// 客户端会话池
///
/// 按目标地址维护可复用的多路复用会话集合。获取流时优先复用未满的
/// 现有会话（first-fit），扫描过程中顺手剔除已关闭的会话，没有可用
/// 会话时才建立新连接。整个获取流程持有池级互斥锁，并发的首次请求
/// 不会为同一地址重复建立会话
use crate::error::Result;
use crate::mux::{MuxSession, MuxStream};
use crate::transport::Connector;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct SessionPool {
    sessions: Mutex<HashMap<String, Vec<Arc<MuxSession>>>>,
    connector: Arc<dyn Connector>,
    max_streams: usize,
}

impl SessionPool {
    /// 创建会话池；`max_streams` 是单个会话允许的最大并发流数
    pub fn new(connector: Arc<dyn Connector>, max_streams: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            connector,
            max_streams,
        }
    }

    /// 获取一个到 `addr` 的逻辑流
    ///
    /// 拨号/握手失败直接返回错误，不做内部重试；打开流失败时该会话
    /// 被整体关闭并移出池，调用方重试会触发新会话的建立
    pub async fn acquire(&self, addr: &str) -> Result<MuxStream> {
        // 会话创建也在锁内进行：串行化带来的吞吐损失换取
        // "同一地址的并发首次请求至多创建一个会话"
        let mut sessions = self.sessions.lock().await;
        let list = sessions.entry(addr.to_string()).or_default();

        // 扫描时剔除所有已关闭的会话，再按 first-fit 选择未满的会话
        let before = list.len();
        list.retain(|s| !s.is_closed());
        if list.len() < before {
            debug!(
                "Evicted {} closed session(s) for {}",
                before - list.len(),
                addr
            );
        }

        let session = match list
            .iter()
            .find(|s| s.num_streams() < s.max_streams())
            .cloned()
        {
            Some(session) => session,
            None => {
                let io = self.connector.connect(addr).await?;
                let session = Arc::new(MuxSession::client(io, self.max_streams));
                info!("Opened new session for {}", addr);
                list.push(session.clone());
                session
            }
        };

        match session.open_stream().await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                // 打开失败说明会话已损坏，关闭并移出池
                session.close();
                list.retain(|s| !Arc::ptr_eq(s, &session));
                Err(e)
            }
        }
    }

    /// 指定地址当前池中的会话数量
    pub async fn session_count(&self, addr: &str) -> usize {
        self.sessions
            .lock()
            .await
            .get(addr)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// 关闭并清空所有会话
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for list in sessions.values() {
            for session in list {
                session.close();
            }
        }
        sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::sync::Mutex as AsyncMutex;
    use tokio::time::sleep;

    /// 内存拨号器：每次 connect 建立一条 duplex 管道，对端挂一个
    /// 持续接受流的服务器会话；记录每次拨号的目标地址
    struct DuplexConnector {
        dials: AtomicUsize,
        dialed_addrs: AsyncMutex<Vec<String>>,
        peers: AsyncMutex<Vec<Arc<MuxSession>>>,
    }

    impl DuplexConnector {
        fn new() -> Self {
            Self {
                dials: AtomicUsize::new(0),
                dialed_addrs: AsyncMutex::new(Vec::new()),
                peers: AsyncMutex::new(Vec::new()),
            }
        }

        fn dial_count(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for DuplexConnector {
        async fn connect(&self, addr: &str) -> Result<Pin<Box<dyn Transport>>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            self.dialed_addrs.lock().await.push(addr.to_string());
            let (a, b) = duplex(64 * 1024);

            let server = Arc::new(MuxSession::server(b));
            self.peers.lock().await.push(server.clone());

            tokio::spawn(async move {
                let mut held = Vec::new();
                while let Some(stream) = server.accept_stream().await {
                    held.push(stream);
                }
            });

            Ok(Box::pin(a))
        }
    }

    /// 始终拨号失败的拨号器
    struct FailingConnector;

    #[async_trait]
    impl Connector for FailingConnector {
        async fn connect(&self, addr: &str) -> Result<Pin<Box<dyn Transport>>> {
            Err(RelayError::dial_failed(
                addr,
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            ))
        }
    }

    /// 拨号"成功"但对端立即消失的拨号器：会话能建立，流打不开
    struct BrokenPeerConnector;

    #[async_trait]
    impl Connector for BrokenPeerConnector {
        async fn connect(&self, _addr: &str) -> Result<Pin<Box<dyn Transport>>> {
            let (a, b) = duplex(64 * 1024);
            drop(b);
            Ok(Box::pin(a))
        }
    }

    #[tokio::test]
    async fn test_first_acquire_creates_one_session() {
        let connector = Arc::new(DuplexConnector::new());
        let pool = SessionPool::new(connector.clone(), 10);

        let stream = pool.acquire("x").await.unwrap();

        assert_eq!(connector.dial_count(), 1);
        assert_eq!(pool.session_count("x").await, 1);

        let sessions = pool.sessions.lock().await;
        assert_eq!(sessions["x"][0].num_streams(), 1);
        drop(sessions);
        drop(stream);
    }

    #[tokio::test]
    async fn test_first_fit_until_full_then_new_session() {
        let connector = Arc::new(DuplexConnector::new());
        let pool = SessionPool::new(connector.clone(), 2);

        let _s1 = pool.acquire("x").await.unwrap();
        let _s2 = pool.acquire("x").await.unwrap();
        assert_eq!(connector.dial_count(), 1);

        // 第一个会话已满（max_streams = 2），第三次获取建新会话
        let _s3 = pool.acquire("x").await.unwrap();
        assert_eq!(connector.dial_count(), 2);
        assert_eq!(pool.session_count("x").await, 2);

        let sessions = pool.sessions.lock().await;
        assert_eq!(sessions["x"][0].num_streams(), 2);
        assert_eq!(sessions["x"][1].num_streams(), 1);
    }

    #[tokio::test]
    async fn test_closed_session_is_evicted_on_next_scan() {
        let connector = Arc::new(DuplexConnector::new());
        let pool = SessionPool::new(connector.clone(), 10);

        let stream = pool.acquire("x").await.unwrap();
        drop(stream);
        assert_eq!(pool.session_count("x").await, 1);

        // 关闭对端，等待会话感知到终止
        {
            let peers = connector.peers.lock().await;
            peers[0].close();
        }
        {
            let sessions = pool.sessions.lock().await;
            let session = sessions["x"][0].clone();
            drop(sessions);
            for _ in 0..100 {
                if session.is_closed() {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
            assert!(session.is_closed());
        }

        // 下一次获取剔除死会话并建立新会话
        let _stream = pool.acquire("x").await.unwrap();
        assert_eq!(connector.dial_count(), 2);
        assert_eq!(pool.session_count("x").await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_acquires_create_one_session() {
        let connector = Arc::new(DuplexConnector::new());
        let pool = Arc::new(SessionPool::new(connector.clone(), 16));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.acquire("x").await }));
        }

        let mut streams = Vec::new();
        for handle in handles {
            streams.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(connector.dial_count(), 1);
        assert_eq!(pool.session_count("x").await, 1);

        let sessions = pool.sessions.lock().await;
        assert_eq!(sessions["x"][0].num_streams(), 8);
    }

    #[tokio::test]
    async fn test_dial_failure_surfaces_without_retry() {
        let pool = SessionPool::new(Arc::new(FailingConnector), 10);

        let err = pool.acquire("x").await.err().unwrap();
        assert!(err.to_string().contains("Failed to dial"));
        assert_eq!(pool.session_count("x").await, 0);
    }

    #[tokio::test]
    async fn test_open_failure_evicts_session_and_surfaces_error() {
        let pool = SessionPool::new(Arc::new(BrokenPeerConnector), 10);

        // 拨号本身成功，新会话先进池；打开流失败后必须整体移出，
        // 不能把坏会话留给后续的获取
        let err = pool.acquire("x").await.err().expect("open should fail");
        assert!(!err.is_config_error());
        assert_eq!(pool.session_count("x").await, 0);

        // 再次获取不会命中残留会话，而是重新拨号再次失败
        assert!(pool.acquire("x").await.is_err());
        assert_eq!(pool.session_count("x").await, 0);
    }

    #[tokio::test]
    async fn test_dial_uses_requested_address() {
        let connector = Arc::new(DuplexConnector::new());
        let pool = SessionPool::new(connector.clone(), 10);

        let _a = pool.acquire("wss://a.example:9443/tcp/").await.unwrap();
        let _b = pool.acquire("wss://b.example:9443/tcp/").await.unwrap();

        let dialed = connector.dialed_addrs.lock().await;
        assert_eq!(
            dialed.as_slice(),
            ["wss://a.example:9443/tcp/", "wss://b.example:9443/tcp/"]
        );
    }

    #[tokio::test]
    async fn test_addresses_do_not_share_sessions() {
        let connector = Arc::new(DuplexConnector::new());
        let pool = SessionPool::new(connector.clone(), 10);

        let _a = pool.acquire("a").await.unwrap();
        let _b = pool.acquire("b").await.unwrap();

        assert_eq!(connector.dial_count(), 2);
        assert_eq!(pool.session_count("a").await, 1);
        assert_eq!(pool.session_count("b").await, 1);
    }
}
