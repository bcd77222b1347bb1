//! 聊天消息领域模型

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{ChatSyncError, Result};
use crate::utils::{current_millis, millis_to_rfc3339, parse_timestamp_millis};

/// 已存储的聊天消息
///
/// 同一聊天内按 `created_at_ms` 升序全序；除 `read` 外写入后不再变更
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// 消息ID（聊天内唯一，由后端分配）
    pub id: String,
    /// 所属聊天ID
    pub chat_id: String,
    /// 发送者ID（系统消息或未知发送者为空）
    pub user_id: Option<String>,
    /// 消息正文
    pub text: String,
    /// 是否已读
    pub read: bool,
    /// ISO-8601 创建时间
    pub created_at: String,
    /// 创建时间（毫秒），唯一排序键
    pub created_at_ms: i64,
}

impl ChatMessage {
    /// 从存储记录解析消息
    ///
    /// 缺少 `id` 的记录无法参与去重，视为畸形记录返回 `None`；
    /// 缺少 `createdAtMs` 时按 0 处理
    pub fn from_record(chat_id: &str, record: &Value) -> Option<Self> {
        let draft = match MessageDraft::deserialize(record) {
            Ok(draft) => draft,
            Err(err) => {
                warn!(chat_id = %chat_id, error = %err, "Unparseable message record");
                return None;
            }
        };

        let id = draft.id.filter(|id| !id.is_empty())?;
        let created_at_ms = draft.created_at_ms.unwrap_or(0);
        Some(Self {
            id,
            chat_id: draft.chat_id.unwrap_or_else(|| chat_id.to_string()),
            user_id: draft.user_id,
            text: draft.text.unwrap_or_default(),
            read: draft.read.unwrap_or(false),
            created_at: draft
                .created_at
                .unwrap_or_else(|| millis_to_rfc3339(created_at_ms)),
            created_at_ms,
        })
    }

    /// 转换为存储记录
    pub fn to_record(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// 待写入的消息
///
/// 字段类型宽松：REST 后端或界面层传来的 id 可能是数字，`read` 可能是数字或字符串，
/// 写入时统一规整为 [`ChatMessage`]
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    #[serde(default, deserialize_with = "coerce::opt_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "coerce::opt_string")]
    pub chat_id: Option<String>,
    #[serde(default, deserialize_with = "coerce::opt_string")]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "coerce::opt_string")]
    pub text: Option<String>,
    #[serde(default, deserialize_with = "coerce::opt_bool")]
    pub read: Option<bool>,
    #[serde(default, deserialize_with = "coerce::opt_string")]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "coerce::opt_i64")]
    pub created_at_ms: Option<i64>,
}

impl MessageDraft {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_created_at(mut self, created_at: impl Into<String>) -> Self {
        self.created_at = Some(created_at.into());
        self
    }

    pub fn with_created_at_ms(mut self, created_at_ms: i64) -> Self {
        self.created_at_ms = Some(created_at_ms);
        self
    }

    pub fn with_read(mut self, read: bool) -> Self {
        self.read = Some(read);
        self
    }

    /// 从 JSON 值解析（字段按宽松规则强制转换）
    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(MessageDraft::deserialize(value)?)
    }

    /// 规整为写入 `chat_id` 的存储记录
    ///
    /// `created_at_ms` 取值顺序：显式给定 → 解析 `created_at` → 当前时间；
    /// `created_at` 缺失时由 `created_at_ms` 生成
    pub fn normalize(self, chat_id: &str) -> Result<ChatMessage> {
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ChatSyncError::InvalidMessage("message id is required".to_string()))?;

        if let Some(draft_chat) = self.chat_id.as_deref() {
            if draft_chat != chat_id {
                warn!(
                    chat_id = %chat_id,
                    draft_chat_id = %draft_chat,
                    message_id = %id,
                    "Draft chat id differs from target chat, using target"
                );
            }
        }

        let created_at_ms = match (self.created_at_ms, self.created_at.as_deref()) {
            (Some(ms), _) => ms,
            (None, Some(raw)) => parse_timestamp_millis(raw).unwrap_or_else(|| {
                warn!(message_id = %id, created_at = %raw, "Unparseable createdAt, using current time");
                current_millis()
            }),
            (None, None) => current_millis(),
        };

        Ok(ChatMessage {
            id,
            chat_id: chat_id.to_string(),
            user_id: self.user_id,
            text: self.text.unwrap_or_default(),
            read: self.read.unwrap_or(false),
            created_at: self
                .created_at
                .unwrap_or_else(|| millis_to_rfc3339(created_at_ms)),
            created_at_ms,
        })
    }
}

/// 订阅状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// 快照读取在途，增量事件进入缓冲
    Initializing,
    /// 快照回放完成，增量事件直接投递
    Live,
    /// 已停止（终态）
    Stopped,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Initializing => "initializing",
            SubscriptionState::Live => "live",
            SubscriptionState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionState::Stopped)
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 投递给订阅者的消息事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEvent {
    Added(ChatMessage),
    Changed(ChatMessage),
    Removed(ChatMessage),
}

impl MessageEvent {
    pub fn message(&self) -> &ChatMessage {
        match self {
            MessageEvent::Added(message)
            | MessageEvent::Changed(message)
            | MessageEvent::Removed(message) => message,
        }
    }

    pub fn id(&self) -> &str {
        &self.message().id
    }
}

/// 宽松字段转换
mod coerce {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            Some(other) => Some(other.to_string()),
        })
    }

    /// 宽松的布尔值：字符串 `"false"`、`"0"` 与空串视为 false
    ///
    /// 有意不同于 JavaScript 的 `Boolean("false") === true`，
    /// 旧客户端以字符串写入的 `read: "false"` 不会被当成已读
    pub fn opt_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => None,
            Some(Value::Bool(b)) => Some(b),
            Some(Value::Number(n)) => Some(n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan())),
            Some(Value::String(s)) => {
                let s = s.trim();
                Some(!(s.is_empty() || s.eq_ignore_ascii_case("false") || s == "0"))
            }
            Some(_) => Some(true),
        })
    }

    pub fn opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<Value>::deserialize(deserializer)? {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
            Some(Value::String(s)) => {
                let s = s.trim();
                s.parse::<i64>().ok().or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f as i64)
                })
            }
            _ => None,
        })
    }
}
