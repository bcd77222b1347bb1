//! 快照 + 增量订阅管理器
//!
//! 每个聊天最多一个活跃订阅，由独立的驱动任务运行三态状态机：
//!
//! - `Initializing`：三个增量监听已挂载，快照读取在途，增量事件进入缓冲
//! - `Live`：快照回放与缓冲冲刷完成，增量事件直接投递
//! - `Stopped`：终态，监听已卸载，账本与缓冲随任务一起丢弃
//!
//! 增量监听在发起快照读取之前同步挂载，因此读取期间的写入不会丢失；
//! 同一消息既出现在快照又出现在增量新增事件中时，由去重账本保证只投递一次。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ledger::DeliveryLedger;
use super::listener::{ChannelListener, MessageListener};
use super::message_store::MessageStore;
use super::model::{ChatMessage, MessageEvent, SubscriptionState};
use crate::config::{ChatSyncConfig, SubscriptionConfig};
use crate::error::Result;
use crate::metrics::ChatSyncMetrics;
use crate::store::{ChildEvent, ChildEventKind, WatchId};

/// 订阅管理器
///
/// 显式对象，可克隆（内部共享），允许多个相互独立的实例
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    messages: MessageStore,
    subscriptions: Mutex<HashMap<String, SubscriptionHandle>>,
    config: SubscriptionConfig,
}

/// 活跃订阅句柄
struct SubscriptionHandle {
    watches: [WatchId; 3],
    state: Arc<watch::Sender<SubscriptionState>>,
    task: JoinHandle<()>,
}

impl SubscriptionManager {
    pub fn new(messages: MessageStore) -> Self {
        Self::with_config(messages, SubscriptionConfig::default())
    }

    pub fn with_config(messages: MessageStore, config: SubscriptionConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                messages,
                subscriptions: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    /// 使用 `[subscription]` 配置构建
    pub fn from_config(messages: MessageStore, config: &ChatSyncConfig) -> Self {
        Self::with_config(messages, config.subscription.clone())
    }

    pub fn messages(&self) -> &MessageStore {
        &self.inner.messages
    }

    fn metrics(&self) -> &Arc<ChatSyncMetrics> {
        self.inner.messages.metrics()
    }

    /// 订阅聊天
    ///
    /// 已有订阅时先停止旧订阅再重新开始，新旧订阅不共享任何状态。
    /// 返回时三个增量监听已经生效，快照读取由驱动任务发起。
    pub async fn subscribe(&self, chat_id: &str, listener: Arc<dyn MessageListener>) -> Result<()> {
        let path = self.inner.messages.messages_path(chat_id)?;
        let mut subscriptions = self.inner.subscriptions.lock().await;

        if let Some(previous) = subscriptions.remove(chat_id) {
            debug!(chat_id = %chat_id, "Replacing existing subscription");
            self.shutdown(chat_id, previous).await;
        }

        let store = self.inner.messages.store();
        let added = store.watch_children(&path, ChildEventKind::Added);
        let changed = store.watch_children(&path, ChildEventKind::Changed);
        let removed = store.watch_children(&path, ChildEventKind::Removed);
        let watches = [added.id, changed.id, removed.id];

        let (state_tx, state_rx) = watch::channel(SubscriptionState::Initializing);
        let state_tx = Arc::new(state_tx);

        let driver = SubscriptionDriver {
            chat_id: chat_id.to_string(),
            listener,
            ledger: DeliveryLedger::new(),
            pending: PendingEvents::new(self.inner.config.channel_capacity_warn),
            state_tx: state_tx.clone(),
            state_rx,
            metrics: self.metrics().clone(),
        };
        let task = tokio::spawn(driver.run(
            self.inner.messages.clone(),
            EventStreams {
                added: added.events,
                changed: changed.events,
                removed: removed.events,
            },
        ));

        subscriptions.insert(
            chat_id.to_string(),
            SubscriptionHandle {
                watches,
                state: state_tx,
                task,
            },
        );
        self.metrics().active_subscriptions.inc();

        info!(chat_id = %chat_id, path = %path, "Subscription started");
        Ok(())
    }

    /// 以通道形式订阅，事件按投递顺序进入返回的接收端
    pub async fn subscribe_channel(
        &self,
        chat_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<MessageEvent>> {
        let (listener, events) = ChannelListener::new();
        self.subscribe(chat_id, Arc::new(listener)).await?;
        Ok(events)
    }

    /// 停止订阅
    ///
    /// 返回后不会再有任何回调；对未订阅或已停止的聊天为空操作
    pub async fn stop(&self, chat_id: &str) {
        let handle = self.inner.subscriptions.lock().await.remove(chat_id);
        match handle {
            Some(handle) => self.shutdown(chat_id, handle).await,
            None => debug!(chat_id = %chat_id, "Stop requested for inactive chat"),
        }
    }

    /// 停止全部订阅
    pub async fn stop_all(&self) {
        let handles: Vec<(String, SubscriptionHandle)> =
            self.inner.subscriptions.lock().await.drain().collect();
        for (chat_id, handle) in handles {
            self.shutdown(&chat_id, handle).await;
        }
    }

    /// 查询订阅状态；没有活跃订阅时返回 None
    pub async fn state(&self, chat_id: &str) -> Option<SubscriptionState> {
        self.inner
            .subscriptions
            .lock()
            .await
            .get(chat_id)
            .map(|handle| *handle.state.borrow())
    }

    /// 等待订阅进入指定状态
    ///
    /// 订阅提前终止时返回 false；没有活跃订阅时仅 `Stopped` 视为已到达
    pub async fn wait_for_state(&self, chat_id: &str, target: SubscriptionState) -> bool {
        let receiver = {
            let subscriptions = self.inner.subscriptions.lock().await;
            match subscriptions.get(chat_id) {
                Some(handle) => handle.state.subscribe(),
                None => return target == SubscriptionState::Stopped,
            }
        };

        let mut receiver = receiver;
        match receiver
            .wait_for(|state| *state == target || state.is_terminal())
            .await
        {
            Ok(state) => *state == target,
            Err(_) => target == SubscriptionState::Stopped,
        }
    }

    /// 当前有活跃订阅的聊天ID（排序后返回）
    pub async fn active_chats(&self) -> Vec<String> {
        let mut chats: Vec<String> = self
            .inner
            .subscriptions
            .lock()
            .await
            .keys()
            .cloned()
            .collect();
        chats.sort();
        chats
    }

    async fn shutdown(&self, chat_id: &str, handle: SubscriptionHandle) {
        let store = self.inner.messages.store();
        for id in handle.watches {
            store.unwatch(id);
        }
        handle.state.send_replace(SubscriptionState::Stopped);

        if let Err(err) = handle.task.await {
            warn!(chat_id = %chat_id, error = %err, "Subscription task ended abnormally");
        }
        self.metrics().active_subscriptions.dec();

        info!(chat_id = %chat_id, "Subscription stopped");
    }
}

/// 三类增量事件接收端
struct EventStreams {
    added: mpsc::UnboundedReceiver<ChildEvent>,
    changed: mpsc::UnboundedReceiver<ChildEvent>,
    removed: mpsc::UnboundedReceiver<ChildEvent>,
}

impl EventStreams {
    /// 非阻塞取出所有已到达的事件，按存储序号恢复到达顺序
    fn drain_ready(&mut self, into: &mut Vec<ChildEvent>) {
        for rx in [&mut self.added, &mut self.changed, &mut self.removed] {
            while let Ok(event) = rx.try_recv() {
                into.push(event);
            }
        }
        into.sort_by_key(|event| event.seq);
    }
}

/// 快照在途期间的分类缓冲
struct PendingEvents {
    added: VecDeque<ChildEvent>,
    changed: VecDeque<ChildEvent>,
    removed: VecDeque<ChildEvent>,
    warn_threshold: usize,
    warned: bool,
}

impl PendingEvents {
    fn new(warn_threshold: usize) -> Self {
        Self {
            added: VecDeque::new(),
            changed: VecDeque::new(),
            removed: VecDeque::new(),
            warn_threshold,
            warned: false,
        }
    }

    fn len(&self) -> usize {
        self.added.len() + self.changed.len() + self.removed.len()
    }

    fn push(&mut self, event: ChildEvent) {
        match event.kind {
            ChildEventKind::Added => self.added.push_back(event),
            ChildEventKind::Changed => self.changed.push_back(event),
            ChildEventKind::Removed => self.removed.push_back(event),
        }
    }

    /// 取出全部缓冲事件，三类合并后按到达顺序排列
    fn take_in_arrival_order(&mut self) -> Vec<ChildEvent> {
        let mut events: Vec<ChildEvent> = self
            .added
            .drain(..)
            .chain(self.changed.drain(..))
            .chain(self.removed.drain(..))
            .collect();
        events.sort_by_key(|event| event.seq);
        events
    }
}

enum Step {
    StateChanged,
    Snapshot(Result<Vec<ChatMessage>>, Duration),
    Event(ChildEvent),
    Closed,
}

/// 单个订阅的驱动任务，独占账本和缓冲
struct SubscriptionDriver {
    chat_id: String,
    listener: Arc<dyn MessageListener>,
    ledger: DeliveryLedger,
    pending: PendingEvents,
    state_tx: Arc<watch::Sender<SubscriptionState>>,
    state_rx: watch::Receiver<SubscriptionState>,
    metrics: Arc<ChatSyncMetrics>,
}

impl SubscriptionDriver {
    async fn run(mut self, messages: MessageStore, mut streams: EventStreams) {
        let chat_id = self.chat_id.clone();
        let snapshot = async move {
            let started = Instant::now();
            let result = messages.read_all_messages(&chat_id).await;
            (result, started.elapsed())
        };
        tokio::pin!(snapshot);
        let mut initializing = true;

        loop {
            let step = tokio::select! {
                biased;
                _ = self.state_rx.changed() => Step::StateChanged,
                (result, elapsed) = &mut snapshot, if initializing => Step::Snapshot(result, elapsed),
                Some(event) = streams.added.recv() => Step::Event(event),
                Some(event) = streams.changed.recv() => Step::Event(event),
                Some(event) = streams.removed.recv() => Step::Event(event),
                else => Step::Closed,
            };

            if self.is_stopped() {
                break;
            }

            match step {
                Step::StateChanged => continue,
                Step::Snapshot(result, elapsed) => {
                    initializing = false;
                    self.complete_snapshot(result, elapsed, &mut streams);
                }
                Step::Event(event) if initializing => self.buffer(event),
                Step::Event(event) => {
                    let mut ready = vec![event];
                    streams.drain_ready(&mut ready);
                    for event in ready {
                        if self.is_stopped() {
                            break;
                        }
                        self.deliver_event(event);
                    }
                }
                Step::Closed => {
                    debug!(chat_id = %self.chat_id, "Store closed all event streams");
                    break;
                }
            }
        }

        debug!(
            chat_id = %self.chat_id,
            delivered = self.ledger.len(),
            discarded = self.pending.len(),
            "Subscription driver exited"
        );
    }

    fn is_stopped(&self) -> bool {
        self.state_rx.borrow().is_terminal()
    }

    fn buffer(&mut self, event: ChildEvent) {
        self.pending.push(event);
        self.metrics.events_buffered_total.inc();

        let buffered = self.pending.len();
        if !self.pending.warned && buffered > self.pending.warn_threshold {
            self.pending.warned = true;
            warn!(
                chat_id = %self.chat_id,
                buffered,
                threshold = self.pending.warn_threshold,
                "Snapshot read still in flight, event buffer is growing"
            );
        }
    }

    /// 快照完成：回放快照、冲刷缓冲、进入 Live
    ///
    /// 读取失败按空快照处理，缓冲事件照常冲刷
    fn complete_snapshot(
        &mut self,
        result: Result<Vec<ChatMessage>>,
        elapsed: Duration,
        streams: &mut EventStreams,
    ) {
        self.metrics
            .snapshot_duration_seconds
            .observe(elapsed.as_secs_f64());

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.metrics.snapshot_failures_total.inc();
                warn!(
                    chat_id = %self.chat_id,
                    error = %err,
                    "Snapshot read failed, continuing with live updates only"
                );
                Vec::new()
            }
        };

        // 读取完成前已到达但尚未取出的事件同样属于缓冲
        let mut arrived = Vec::new();
        streams.drain_ready(&mut arrived);
        for event in arrived {
            self.buffer(event);
        }

        let snapshot_len = snapshot.len();
        for message in snapshot {
            if self.is_stopped() {
                return;
            }
            self.deliver(ChildEventKind::Added, &message);
        }

        let buffered = self.pending.take_in_arrival_order();
        let buffered_len = buffered.len();
        for event in buffered {
            if self.is_stopped() {
                return;
            }
            self.deliver_event(event);
        }

        let went_live = self.state_tx.send_if_modified(|state| {
            if *state == SubscriptionState::Initializing {
                *state = SubscriptionState::Live;
                true
            } else {
                false
            }
        });
        if went_live {
            info!(
                chat_id = %self.chat_id,
                snapshot = snapshot_len,
                buffered = buffered_len,
                "Subscription is live"
            );
        }
    }

    fn deliver_event(&mut self, event: ChildEvent) {
        match ChatMessage::from_record(&self.chat_id, &event.value) {
            Some(message) => self.deliver(event.kind, &message),
            None => {
                self.metrics.malformed_records_total.inc();
                warn!(
                    chat_id = %self.chat_id,
                    key = %event.key,
                    kind = %event.kind,
                    "Skipping incremental event without message id"
                );
            }
        }
    }

    /// 投递单条消息；只有新增事件查账去重
    fn deliver(&mut self, kind: ChildEventKind, message: &ChatMessage) {
        match kind {
            ChildEventKind::Added => {
                if !self.ledger.first_delivery(&message.id) {
                    self.metrics.duplicates_suppressed_total.inc();
                    debug!(
                        chat_id = %self.chat_id,
                        message_id = %message.id,
                        "Duplicate added event suppressed"
                    );
                    return;
                }
                self.listener.on_added(message);
            }
            ChildEventKind::Changed => {
                self.note_unknown_target(kind, message);
                self.listener.on_changed(message);
            }
            ChildEventKind::Removed => {
                self.note_unknown_target(kind, message);
                self.listener.on_removed(message);
            }
        }
        self.metrics
            .events_delivered_total
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    fn note_unknown_target(&self, kind: ChildEventKind, message: &ChatMessage) {
        if !self.ledger.contains(&message.id) {
            debug!(
                chat_id = %self.chat_id,
                message_id = %message.id,
                kind = %kind,
                "Event for a message never delivered as added"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::sync::model::MessageDraft;

    fn setup() -> (Arc<MemoryStore>, SubscriptionManager) {
        let store = Arc::new(MemoryStore::new());
        let messages =
            MessageStore::new(store.clone()).with_metrics(Arc::new(ChatSyncMetrics::new()));
        let manager = SubscriptionManager::new(messages);
        (store, manager)
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (store, manager) = setup();
        store.hold_reads();

        let _events = manager.subscribe_channel("c1").await.unwrap();
        assert_eq!(
            manager.state("c1").await,
            Some(SubscriptionState::Initializing)
        );

        store.release_reads();
        assert!(manager.wait_for_state("c1", SubscriptionState::Live).await);
        assert_eq!(manager.state("c1").await, Some(SubscriptionState::Live));

        manager.stop("c1").await;
        assert_eq!(manager.state("c1").await, None);
        assert!(manager.wait_for_state("c1", SubscriptionState::Stopped).await);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (store, manager) = setup();
        manager.stop("never").await;

        let _events = manager.subscribe_channel("c1").await.unwrap();
        manager.stop("c1").await;
        manager.stop("c1").await;

        let path = manager.messages().messages_path("c1").unwrap();
        assert_eq!(store.listener_count(&path), 0);
        assert_eq!(manager.active_chats().await, Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_subscribe_rejects_invalid_chat_id() {
        let (_, manager) = setup();
        assert!(manager.subscribe_channel("bad/id").await.is_err());
        assert!(manager.active_chats().await.is_empty());
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_previous() {
        let (store, manager) = setup();
        let mut first = manager.subscribe_channel("c1").await.unwrap();
        let mut second = manager.subscribe_channel("c1").await.unwrap();
        assert!(manager.wait_for_state("c1", SubscriptionState::Live).await);

        let path = manager.messages().messages_path("c1").unwrap();
        assert_eq!(store.listener_count(&path), 3);

        manager
            .messages()
            .write_message("c1", MessageDraft::new("m1", "hi").with_created_at_ms(1))
            .await
            .unwrap();

        let event = second.recv().await.unwrap();
        assert_eq!(event.id(), "m1");
        // 旧订阅的发送端已随驱动任务释放
        assert!(first.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_all_and_active_chats() {
        let (_, manager) = setup();
        let _a = manager.subscribe_channel("b").await.unwrap();
        let _b = manager.subscribe_channel("a").await.unwrap();
        assert_eq!(manager.active_chats().await, vec!["a", "b"]);
        assert_eq!(manager.messages().metrics().active_subscriptions.get(), 2);

        manager.stop_all().await;
        assert!(manager.active_chats().await.is_empty());
        assert_eq!(manager.messages().metrics().active_subscriptions.get(), 0);
    }

    #[tokio::test]
    async fn test_from_config_wires_store_root_and_subscription() {
        let config: ChatSyncConfig = toml::from_str(
            "[store]\nroot = \"tenants/t1/chats\"\n\n[subscription]\nchannel_capacity_warn = 4\n",
        )
        .unwrap();
        let store = Arc::new(MemoryStore::new());
        let messages = MessageStore::from_config(store.clone(), &config.store)
            .unwrap()
            .with_metrics(Arc::new(ChatSyncMetrics::new()));
        let manager = SubscriptionManager::from_config(messages, &config);
        assert_eq!(manager.inner.config.channel_capacity_warn, 4);

        let mut events = manager.subscribe_channel("c1").await.unwrap();
        assert!(manager.wait_for_state("c1", SubscriptionState::Live).await);
        let path = crate::store::StorePath::chat_messages("tenants/t1/chats", "c1").unwrap();
        assert_eq!(store.listener_count(&path), 3);

        manager
            .messages()
            .write_message("c1", MessageDraft::new("m1", "hi").with_created_at_ms(1))
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap().id(), "m1");
        manager.stop("c1").await;
    }

    #[test]
    fn test_pending_events_merge_by_arrival() {
        let mut pending = PendingEvents::new(1);
        let event = |kind, seq| ChildEvent {
            kind,
            key: format!("k{seq}"),
            value: serde_json::Value::Null,
            seq,
        };
        pending.push(event(ChildEventKind::Changed, 2));
        pending.push(event(ChildEventKind::Added, 1));
        pending.push(event(ChildEventKind::Removed, 4));
        pending.push(event(ChildEventKind::Added, 3));
        assert_eq!(pending.len(), 4);

        let seqs: Vec<u64> = pending
            .take_in_arrival_order()
            .into_iter()
            .map(|event| event.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(pending.len(), 0);
    }
}
