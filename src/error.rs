//! 聊天同步错误类型定义

use thiserror::Error;

/// 聊天同步错误类型
#[derive(Debug, Error)]
pub enum ChatSyncError {
    /// 消息记录无效（缺少 id 等）
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// 存储路径无效
    #[error("Invalid store path: {0}")]
    InvalidPath(String),

    /// 记录不存在
    #[error("Not found: {0}")]
    NotFound(String),

    /// 存储不可达
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// 无权限
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// 后端返回非 2xx
    #[error("Backend error (status {status}): {body}")]
    Backend { status: u16, body: String },

    /// HTTP 传输错误
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 其他错误
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// 聊天同步结果类型
pub type Result<T> = std::result::Result<T, ChatSyncError>;

impl ChatSyncError {
    /// 是否为可重试的瞬时错误（存储不可达、网络错误、5xx）
    pub fn is_transient(&self) -> bool {
        match self {
            ChatSyncError::StoreUnavailable(_) => true,
            ChatSyncError::Http(err) => err.is_timeout() || err.is_connect(),
            ChatSyncError::Backend { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
