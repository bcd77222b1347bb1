//! 订阅回调接口

use tokio::sync::mpsc;

use super::model::{ChatMessage, MessageEvent};

/// 订阅回调（需要作为 trait 对象使用）
///
/// 回调在订阅任务中同步执行，不应阻塞。
///
/// # 约定
/// - `on_added` 对同一订阅内的同一消息ID最多调用一次。
/// - `on_changed` / `on_removed` 不经过去重：可能收到从未经 `on_added` 投递过的消息ID
///   （例如快照读取失败后到达的变更）。实现方必须忽略未知ID，而不是报错。
pub trait MessageListener: Send + Sync {
    fn on_added(&self, message: &ChatMessage);

    fn on_changed(&self, message: &ChatMessage);

    fn on_removed(&self, message: &ChatMessage);
}

/// 基于 mpsc 通道的回调，把事件转为 [`MessageEvent`] 交给消费方自行处理
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<MessageEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MessageEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: MessageEvent) {
        // 接收端已关闭说明消费方不再关心，丢弃即可
        let _ = self.tx.send(event);
    }
}

impl MessageListener for ChannelListener {
    fn on_added(&self, message: &ChatMessage) {
        self.forward(MessageEvent::Added(message.clone()));
    }

    fn on_changed(&self, message: &ChatMessage) {
        self.forward(MessageEvent::Changed(message.clone()));
    }

    fn on_removed(&self, message: &ChatMessage) {
        self.forward(MessageEvent::Removed(message.clone()));
    }
}

type Callback = Box<dyn Fn(&ChatMessage) + Send + Sync>;

/// 闭包回调；未设置的回调为空操作
#[derive(Default)]
pub struct FnListener {
    added: Option<Callback>,
    changed: Option<Callback>,
    removed: Option<Callback>,
}

impl FnListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_added(mut self, f: impl Fn(&ChatMessage) + Send + Sync + 'static) -> Self {
        self.added = Some(Box::new(f));
        self
    }

    pub fn with_changed(mut self, f: impl Fn(&ChatMessage) + Send + Sync + 'static) -> Self {
        self.changed = Some(Box::new(f));
        self
    }

    pub fn with_removed(mut self, f: impl Fn(&ChatMessage) + Send + Sync + 'static) -> Self {
        self.removed = Some(Box::new(f));
        self
    }
}

impl MessageListener for FnListener {
    fn on_added(&self, message: &ChatMessage) {
        if let Some(f) = &self.added {
            f(message);
        }
    }

    fn on_changed(&self, message: &ChatMessage) {
        if let Some(f) = &self.changed {
            f(message);
        }
    }

    fn on_removed(&self, message: &ChatMessage) {
        if let Some(f) = &self.removed {
            f(message);
        }
    }
}
