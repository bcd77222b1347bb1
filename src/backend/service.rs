//! 聊天服务：组合 REST 后端与消息存储

use std::sync::Arc;

use tracing::{info, warn};

use super::{ChatBackend, ChatSummary, HttpChatBackend, SendMessageRequest};
use crate::config::ChatSyncConfig;
use crate::error::Result;
use crate::store::RealtimeStore;
use crate::sync::{ChatMessage, MessageDraft, MessageStore};

/// 界面层使用的聊天服务
///
/// 后端是写入的权威来源，成功后再写入实时存储，由订阅推送给各端
#[derive(Clone)]
pub struct ChatService {
    backend: Arc<dyn ChatBackend>,
    messages: MessageStore,
}

impl ChatService {
    pub fn new(backend: Arc<dyn ChatBackend>, messages: MessageStore) -> Self {
        Self { backend, messages }
    }

    /// 按应用配置组装：HTTP 后端加上配置根路径下的消息存储
    pub fn from_config(store: Arc<dyn RealtimeStore>, config: &ChatSyncConfig) -> Result<Self> {
        let backend = HttpChatBackend::from_config(&config.backend)?;
        let messages = MessageStore::from_config(store, &config.store)?;
        Ok(Self::new(Arc::new(backend), messages))
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>> {
        self.backend.list_chats().await
    }

    /// 发送消息：后端分配 id 后写入存储
    pub async fn send_message(
        &self,
        chat_id: &str,
        request: SendMessageRequest,
    ) -> Result<ChatMessage> {
        let draft = self.backend.send_message(chat_id, request).await?;
        let message = self.messages.write_message(chat_id, draft).await?;
        info!(chat_id = %chat_id, message_id = %message.id, "Message sent");
        Ok(message)
    }

    /// 拉取历史消息并逐条写入存储，返回写入条数
    ///
    /// 无法解析或缺少 id 的记录跳过；写入失败立即返回
    pub async fn sync_history(&self, chat_id: &str) -> Result<usize> {
        let records = self.backend.fetch_messages(chat_id).await?;
        let total = records.len();
        let mut written = 0;

        for record in records {
            let draft = match MessageDraft::from_value(&record) {
                Ok(draft) if draft.id.as_deref().is_some_and(|id| !id.is_empty()) => draft,
                Ok(_) => {
                    self.messages.metrics().malformed_records_total.inc();
                    warn!(chat_id = %chat_id, "Skipping history record without id");
                    continue;
                }
                Err(err) => {
                    self.messages.metrics().malformed_records_total.inc();
                    warn!(chat_id = %chat_id, error = %err, "Skipping unparseable history record");
                    continue;
                }
            };
            self.messages.write_message(chat_id, draft).await?;
            written += 1;
        }

        info!(chat_id = %chat_id, total, written, "History synced");
        Ok(written)
    }

    /// 标记已读：先通知后端，再更新存储
    pub async fn mark_read(&self, chat_id: &str, message_id: &str) -> Result<()> {
        self.backend.mark_read(chat_id, message_id).await?;
        self.messages.mark_read(chat_id, message_id).await
    }
}
