//! 聊天消息同步
//!
//! - [`MessageStore`]：消息读写适配器
//! - [`SubscriptionManager`]：快照 + 增量订阅
//! - [`DeliveryLedger`]：订阅内的新增事件去重账本

pub mod ledger;
pub mod listener;
pub mod message_store;
pub mod model;
pub mod subscription;

pub use ledger::DeliveryLedger;
pub use listener::{ChannelListener, FnListener, MessageListener};
pub use message_store::MessageStore;
pub use model::{ChatMessage, MessageDraft, MessageEvent, SubscriptionState};
pub use subscription::SubscriptionManager;
