/// 双向字节搬运
///
/// 隧道两端建立后，剩下的工作只是对拷字节直到任一方向结束；
/// 返回时两端都由调用方（通过 Drop）关闭
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tracing::debug;

/// 在两条双工连接之间双向复制，返回 (a→b, b→a) 的字节数
///
/// 任一侧的 I/O 错误都会结束搬运；错误只记录日志，不再向上传播
pub async fn bridge<A, B>(a: &mut A, b: &mut B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let result = copy_bidirectional(a, b).await;
    if let Ok((up, down)) = &result {
        debug!("Bridge finished: {} bytes up, {} bytes down", up, down);
    }
    result
}
