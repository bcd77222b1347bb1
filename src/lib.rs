//! Flare Chat Sync 公共库
//!
//! 聊天消息的实时同步层：消息存储适配、快照 + 增量订阅、投递去重，
//! 以及与 REST 后端的组合服务

pub mod backend;
pub mod config;
pub mod error;
pub mod metrics;
pub mod store;
pub mod sync;
pub mod tracing;
pub mod utils;

pub use backend::{ChatBackend, ChatService, ChatSummary, HttpChatBackend, SendMessageRequest};
pub use config::{
    BackendConfig, ChatSyncConfig, ConfigManager, LoggingConfig, StoreConfig, SubscriptionConfig,
    app_config, load_config,
};
pub use error::*;
pub use metrics::ChatSyncMetrics;
pub use store::{MemoryStore, RealtimeStore, StorePath};
pub use sync::{
    ChannelListener, ChatMessage, DeliveryLedger, FnListener, MessageDraft, MessageEvent,
    MessageListener, MessageStore, SubscriptionManager, SubscriptionState,
};
pub use utils::*;
