//! 错误定义模块

use thiserror::Error;

/// PACS系统统一错误类型
#[derive(Error, Debug)]
pub enum PacsError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    /// 本地缓存写入失败（磁盘、约束冲突等）
    #[error("数据库写入错误: {0}")]
    StoreWrite(String),

    /// 远端不可达：连接被拒绝/重置、超时、DNS失败
    #[error("远端服务不可用: {0}")]
    RemoteUnavailable(String),

    /// 远端返回非2xx状态码
    #[error("远端HTTP错误: {status} ({url})")]
    RemoteHttp { status: u16, url: String },

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("全量同步正在进行中")]
    SyncInProgress,

    #[error("系统内部错误: {0}")]
    Internal(String),
}

impl PacsError {
    /// 是否为可在下一周期重试的瞬时错误
    ///
    /// 网络层错误总是瞬时的；HTTP错误仅在 5xx、408、429 时视为瞬时。
    pub fn is_transient(&self) -> bool {
        match self {
            PacsError::RemoteUnavailable(_) => true,
            PacsError::RemoteHttp { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }

    /// 是否为远端错误（不可达或HTTP错误）
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            PacsError::RemoteUnavailable(_) | PacsError::RemoteHttp { .. }
        )
    }

    /// 远端返回404
    pub fn is_remote_not_found(&self) -> bool {
        matches!(self, PacsError::RemoteHttp { status: 404, .. })
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for PacsError {
    fn from(err: sqlx::Error) -> Self {
        PacsError::Database(err.to_string())
    }
}

/// PACS系统统一结果类型
pub type Result<T> = std::result::Result<T, PacsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PacsError::RemoteUnavailable("connection refused".into()).is_transient());
        assert!(PacsError::RemoteHttp { status: 503, url: "/changes".into() }.is_transient());
        assert!(PacsError::RemoteHttp { status: 429, url: "/changes".into() }.is_transient());
        assert!(!PacsError::RemoteHttp { status: 401, url: "/changes".into() }.is_transient());
        assert!(!PacsError::StoreWrite("disk full".into()).is_transient());
    }

    #[test]
    fn test_remote_not_found() {
        let err = PacsError::RemoteHttp { status: 404, url: "/studies/x".into() };
        assert!(err.is_remote());
        assert!(err.is_remote_not_found());
        assert!(!PacsError::SyncInProgress.is_remote());
    }
}
