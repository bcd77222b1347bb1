//! REST 后端协作方
//!
//! 后端负责聊天列表、历史消息、发送与已读；成功发送后返回的消息记录
//! 经 [`MessageStore`](crate::sync::MessageStore) 写入实时存储。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::sync::MessageDraft;

mod http;
mod service;

pub use http::HttpChatBackend;
pub use service::ChatService;

/// 聊天列表条目
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    /// 参与者ID（两人聊天）
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub unread_count: u32,
}

/// 发送消息请求体
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl SendMessageRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user_id: None,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// REST 后端接口（需要作为 trait 对象使用，保留 async-trait）
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// 获取聊天列表
    async fn list_chats(&self) -> Result<Vec<ChatSummary>>;

    /// 获取聊天历史消息（原始记录，由调用方规整）
    async fn fetch_messages(&self, chat_id: &str) -> Result<Vec<Value>>;

    /// 发送消息，返回后端分配了 id 的消息记录
    async fn send_message(&self, chat_id: &str, request: SendMessageRequest)
    -> Result<MessageDraft>;

    /// 标记消息已读
    async fn mark_read(&self, chat_id: &str, message_id: &str) -> Result<()>;
}
