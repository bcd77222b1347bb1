//! 实时键值树存储抽象
//!
//! 消息以 `chats/<chatId>/messages/<messageId>` 的层级路径存放，每条消息一条记录。
//! 存储除了一次性读写之外，还会对子节点的新增 / 变更 / 删除推送增量事件。

mod memory;

pub use memory::MemoryStore;

use std::fmt;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::{ChatSyncError, Result};

/// 默认的聊天根路径
pub const DEFAULT_CHATS_ROOT: &str = "chats";

/// 消息集合在聊天节点下的子路径
pub const MESSAGES_SEGMENT: &str = "messages";

/// 键名中不允许出现的字符（与实时数据库的键约束一致）
const FORBIDDEN_KEY_CHARS: [char; 6] = ['/', '.', '#', '$', '[', ']'];

/// 层级存储路径
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    /// 解析以 `/` 分隔的路径，忽略首尾的 `/`
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Err(ChatSyncError::InvalidPath("path is empty".to_string()));
        }

        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            validate_segment(segment)?;
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// 追加一级子路径
    pub fn child(&self, segment: &str) -> Result<Self> {
        validate_segment(segment)?;
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self { segments })
    }

    /// 某个聊天的消息集合路径：`<root>/<chatId>/messages`
    pub fn chat_messages(root: &str, chat_id: &str) -> Result<Self> {
        Self::parse(root)?.child(chat_id)?.child(MESSAGES_SEGMENT)
    }

    /// 单条消息路径：`<root>/<chatId>/messages/<messageId>`
    pub fn message(root: &str, chat_id: &str, message_id: &str) -> Result<Self> {
        Self::chat_messages(root, chat_id)?.child(message_id)
    }

    /// 父路径（根路径没有父路径）
    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() < 2 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// 最后一级键名
    pub fn key(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    /// 拆分为 (父路径, 键名)，用于写入单个子节点
    pub(crate) fn split_child(&self) -> Result<(Self, String)> {
        let parent = self.parent().ok_or_else(|| {
            ChatSyncError::InvalidPath(format!("path {} has no parent node", self))
        })?;
        Ok((parent, self.key().to_string()))
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(ChatSyncError::InvalidPath(
            "path segment must not be empty".to_string(),
        ));
    }
    if segment
        .chars()
        .any(|c| FORBIDDEN_KEY_CHARS.contains(&c) || c.is_ascii_control())
    {
        return Err(ChatSyncError::InvalidPath(format!(
            "path segment {:?} contains a forbidden character",
            segment
        )));
    }
    Ok(())
}

/// 增量事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildEventKind {
    Added,
    Changed,
    Removed,
}

impl ChildEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildEventKind::Added => "added",
            ChildEventKind::Changed => "changed",
            ChildEventKind::Removed => "removed",
        }
    }
}

impl fmt::Display for ChildEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 存储推送的子节点增量事件
#[derive(Debug, Clone, PartialEq)]
pub struct ChildEvent {
    pub kind: ChildEventKind,
    /// 子节点键名
    pub key: String,
    /// Added/Changed 为新值，Removed 为删除前的值
    pub value: Value,
    /// 存储全局递增的到达序号，用于跨事件类型恢复到达顺序
    pub seq: u64,
}

/// 监听器标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u64);

/// 一个已注册的增量监听
#[derive(Debug)]
pub struct ChildWatch {
    pub id: WatchId,
    pub kind: ChildEventKind,
    pub events: mpsc::UnboundedReceiver<ChildEvent>,
}

/// 实时存储接口（需要作为 trait 对象使用，保留 async-trait）
#[async_trait]
pub trait RealtimeStore: Send + Sync {
    /// 一次性读取某节点下的全部子节点，按存储原生顺序（键序）返回
    ///
    /// 节点不存在时返回空列表
    async fn read_children(&self, path: &StorePath) -> Result<Vec<(String, Value)>>;

    /// 写入（覆盖）一个子节点；新键推送 Added，已有键推送 Changed
    async fn set(&self, path: &StorePath, value: Value) -> Result<()>;

    /// 合并字段到已有子节点，推送 Changed；子节点不存在时返回 NotFound
    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<()>;

    /// 删除子节点，推送 Removed；不存在时为空操作
    async fn remove(&self, path: &StorePath) -> Result<()>;

    /// 同步注册某一类增量监听，返回后立即生效
    fn watch_children(&self, path: &StorePath, kind: ChildEventKind) -> ChildWatch;

    /// 注销监听（幂等）
    fn unwatch(&self, id: WatchId);
}
