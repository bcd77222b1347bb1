//! 消息存储适配器
//!
//! 负责把领域消息写入实时存储、一次性读取并规整输出

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::model::{ChatMessage, MessageDraft};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::metrics::ChatSyncMetrics;
use crate::store::{DEFAULT_CHATS_ROOT, RealtimeStore, StorePath};

/// 消息存储适配器
#[derive(Clone)]
pub struct MessageStore {
    store: Arc<dyn RealtimeStore>,
    root: String,
    metrics: Arc<ChatSyncMetrics>,
}

impl MessageStore {
    /// 使用默认根路径 `chats`
    pub fn new(store: Arc<dyn RealtimeStore>) -> Self {
        Self::with_root(store, DEFAULT_CHATS_ROOT)
    }

    /// 默认使用进程级共享指标
    pub fn with_root(store: Arc<dyn RealtimeStore>, root: impl Into<String>) -> Self {
        Self {
            store,
            root: root.into(),
            metrics: ChatSyncMetrics::shared(),
        }
    }

    /// 按 `[store]` 配置构建，根路径非法时返回错误
    pub fn from_config(store: Arc<dyn RealtimeStore>, config: &StoreConfig) -> Result<Self> {
        let root = StorePath::parse(&config.root)?;
        debug!(root = %root, "Message store configured");
        Ok(Self::with_root(store, root.to_string()))
    }

    /// 替换指标实例，例如按租户隔离统计
    pub fn with_metrics(mut self, metrics: Arc<ChatSyncMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &Arc<dyn RealtimeStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<ChatSyncMetrics> {
        &self.metrics
    }

    /// 聊天的消息集合路径
    pub fn messages_path(&self, chat_id: &str) -> Result<StorePath> {
        StorePath::chat_messages(&self.root, chat_id)
    }

    /// 写入（覆盖）一条消息
    ///
    /// 同一 id 重复写入以最后一次为准；存在的 id 触发变更事件，否则触发新增事件。
    /// 写入失败直接返回给调用方，不做重试。
    pub async fn write_message(&self, chat_id: &str, draft: MessageDraft) -> Result<ChatMessage> {
        let message = draft.normalize(chat_id)?;
        let path = StorePath::message(&self.root, chat_id, &message.id)?;
        let record = message.to_record()?;

        if let Err(err) = self.store.set(&path, record).await {
            warn!(
                chat_id = %chat_id,
                message_id = %message.id,
                error = %err,
                "Failed to write message"
            );
            return Err(err);
        }

        debug!(
            chat_id = %chat_id,
            message_id = %message.id,
            created_at_ms = message.created_at_ms,
            "Message written"
        );
        Ok(message)
    }

    /// 一次性读取聊天内全部消息，按 `created_at_ms` 升序
    ///
    /// 同一时间戳保持存储原生顺序；聊天不存在时返回空列表
    pub async fn read_all_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        let path = self.messages_path(chat_id)?;
        let children = self.store.read_children(&path).await?;
        Ok(self.collect_sorted(chat_id, children))
    }

    /// 标记消息已读（消息写入后唯一允许的变更）
    pub async fn mark_read(&self, chat_id: &str, message_id: &str) -> Result<()> {
        let path = StorePath::message(&self.root, chat_id, message_id)?;
        let mut fields = Map::new();
        fields.insert("read".to_string(), Value::Bool(true));
        self.store.update(&path, fields).await?;
        debug!(chat_id = %chat_id, message_id = %message_id, "Message marked as read");
        Ok(())
    }

    /// 删除消息（例如审核下架），所有活跃订阅都会收到删除事件
    pub async fn remove_message(&self, chat_id: &str, message_id: &str) -> Result<()> {
        let path = StorePath::message(&self.root, chat_id, message_id)?;
        self.store.remove(&path).await?;
        debug!(chat_id = %chat_id, message_id = %message_id, "Message removed");
        Ok(())
    }

    /// 解析记录、跳过畸形记录并稳定排序
    fn collect_sorted(&self, chat_id: &str, children: Vec<(String, Value)>) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(children.len());
        for (key, record) in children {
            match ChatMessage::from_record(chat_id, &record) {
                Some(message) => messages.push(message),
                None => {
                    self.metrics.malformed_records_total.inc();
                    warn!(chat_id = %chat_id, key = %key, "Skipping message record without id");
                }
            }
        }
        messages.sort_by_key(|message| message.created_at_ms);
        messages
    }
}
