/// MWSS Relay 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod bridge;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod mux;
pub mod pool;
pub mod server;
pub mod tls;
pub mod transport;

// 重新导出常用类型
pub use config::{AppConfig, ClientConfig, ServerConfig};
pub use error::{RelayError, Result};
pub use mux::{MuxSession, MuxStream};
pub use pool::SessionPool;
pub use server::{AcceptBackoff, IntakeQueue};
