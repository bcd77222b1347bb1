// 订阅集成测试 - 快照回放、缓冲冲刷、去重、停止与失败降级
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use flare_chat_sync::store::ChildEventKind;
use flare_chat_sync::{
    ChatMessage, ChatSyncMetrics, FnListener, MemoryStore, MessageDraft, MessageEvent, MessageStore, RealtimeStore,
    StorePath, SubscriptionManager, SubscriptionState,
};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_test::assert_ok;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(100);

fn setup() -> (Arc<MemoryStore>, MessageStore, SubscriptionManager) {
    let _ = tracing_subscriber::fmt::try_init();
    let store = Arc::new(MemoryStore::new());
    // 每个场景使用独立指标，计数断言不受并行测试影响
    let messages =
        MessageStore::new(store.clone()).with_metrics(Arc::new(ChatSyncMetrics::new()));
    let manager = SubscriptionManager::new(messages.clone());
    (store, messages, manager)
}

async fn write(messages: &MessageStore, chat_id: &str, id: &str, text: &str, ms: i64) {
    assert_ok!(
        messages
            .write_message(chat_id, MessageDraft::new(id, text).with_created_at_ms(ms))
            .await
    );
}

/// 等待驱动任务发起的快照读取被挂起
async fn wait_for_held_read(store: &MemoryStore) {
    timeout(WAIT, async {
        while store.held_reads() == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("snapshot read was never issued");
}

async fn next_event(rx: &mut UnboundedReceiver<MessageEvent>) -> MessageEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

async fn next_events(rx: &mut UnboundedReceiver<MessageEvent>, n: usize) -> Vec<MessageEvent> {
    let mut events = Vec::with_capacity(n);
    for _ in 0..n {
        events.push(next_event(rx).await);
    }
    events
}

async fn assert_quiet(rx: &mut UnboundedReceiver<MessageEvent>) {
    match timeout(QUIET, rx.recv()).await {
        Err(_) | Ok(None) => {}
        Ok(Some(event)) => panic!("unexpected event: {event:?}"),
    }
}

fn added_ids(events: &[MessageEvent]) -> Vec<&str> {
    events
        .iter()
        .filter(|event| matches!(event, MessageEvent::Added(_)))
        .map(|event| event.id())
        .collect()
}

#[tokio::test]
async fn test_empty_chat_then_write_delivers_once() {
    let (_, messages, manager) = setup();
    let mut rx = manager.subscribe_channel("c1").await.unwrap();
    assert!(manager.wait_for_state("c1", SubscriptionState::Live).await);

    write(&messages, "c1", "m1", "hi", 1000).await;

    match next_event(&mut rx).await {
        MessageEvent::Added(message) => {
            assert_eq!(message.id, "m1");
            assert_eq!(message.text, "hi");
            assert_eq!(message.chat_id, "c1");
            assert_eq!(message.created_at_ms, 1000);
        }
        other => panic!("expected added, got {other:?}"),
    }
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_snapshot_sorted_then_buffered_event_flushed() {
    let (store, messages, manager) = setup();
    write(&messages, "c2", "m2", "second", 200).await;
    write(&messages, "c2", "m1", "first", 100).await;

    store.hold_reads();
    let mut rx = manager.subscribe_channel("c2").await.unwrap();
    wait_for_held_read(&store).await;

    write(&messages, "c2", "m3", "late", 150).await;
    assert_eq!(
        manager.state("c2").await,
        Some(SubscriptionState::Initializing)
    );

    store.release_reads();
    let events = next_events(&mut rx, 3).await;
    assert_eq!(added_ids(&events), vec!["m1", "m2", "m3"]);

    assert!(manager.wait_for_state("c2", SubscriptionState::Live).await);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_write_racing_snapshot_is_delivered_once() {
    let (_, messages, manager) = setup();
    let mut rx = manager.subscribe_channel("c1").await.unwrap();

    // 驱动任务尚未运行：写入同时进入快照与增量缓冲
    write(&messages, "c1", "m1", "race", 10).await;

    assert!(manager.wait_for_state("c1", SubscriptionState::Live).await);
    let events = next_events(&mut rx, 1).await;
    assert_eq!(added_ids(&events), vec!["m1"]);
    assert_quiet(&mut rx).await;
    assert_eq!(messages.metrics().duplicates_suppressed_total.get(), 1);
}

#[tokio::test]
async fn test_n_distinct_writes_yield_n_added_events() {
    let (_, messages, manager) = setup();
    let mut rx = manager.subscribe_channel("c1").await.unwrap();
    assert!(manager.wait_for_state("c1", SubscriptionState::Live).await);

    for i in 0..20 {
        write(&messages, "c1", &format!("m{i}"), "x", 1000 + i).await;
    }

    let events = next_events(&mut rx, 20).await;
    let mut ids = added_ids(&events);
    assert_eq!(ids.len(), 20);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20);
    assert_quiet(&mut rx).await;
    assert_eq!(messages.metrics().delivered("added"), 20);
}

#[tokio::test]
async fn test_stop_before_snapshot_resolves_delivers_nothing() {
    let (store, messages, manager) = setup();
    write(&messages, "c1", "m1", "existing", 1).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let listener = FnListener::new()
        .with_added({
            let counter = counter.clone();
            move |_: &ChatMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .with_changed({
            let counter = counter.clone();
            move |_: &ChatMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .with_removed(move |_: &ChatMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    store.hold_reads();
    manager.subscribe("c1", Arc::new(listener)).await.unwrap();
    wait_for_held_read(&store).await;
    write(&messages, "c1", "m2", "buffered", 2).await;

    manager.stop("c1").await;
    assert_eq!(manager.state("c1").await, None);

    let path = StorePath::chat_messages("chats", "c1").unwrap();
    assert_eq!(store.listener_count(&path), 0);

    store.release_reads();
    write(&messages, "c1", "m3", "after stop", 3).await;
    messages.mark_read("c1", "m1").await.unwrap();
    tokio::time::sleep(QUIET).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_snapshot_failure_goes_live_and_flushes_buffer() {
    let (store, messages, manager) = setup();
    write(&messages, "c1", "old", "unseen history", 1).await;

    store.fail_reads(true);
    store.hold_reads();
    let mut rx = manager.subscribe_channel("c1").await.unwrap();
    wait_for_held_read(&store).await;

    write(&messages, "c1", "m5", "buffered", 5).await;
    store.release_reads();

    let events = next_events(&mut rx, 1).await;
    assert_eq!(added_ids(&events), vec!["m5"]);
    assert!(manager.wait_for_state("c1", SubscriptionState::Live).await);
    assert_eq!(messages.metrics().snapshot_failures_total.get(), 1);

    // 降级后增量照常到达；未出现在快照中的消息的变更也会放行
    messages.mark_read("c1", "old").await.unwrap();
    match next_event(&mut rx).await {
        MessageEvent::Changed(message) => {
            assert_eq!(message.id, "old");
            assert!(message.read);
        }
        other => panic!("expected changed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_buffered_mutations_flush_in_arrival_order() {
    let (store, messages, manager) = setup();
    write(&messages, "c1", "m1", "existing", 1).await;

    store.hold_reads();
    let mut rx = manager.subscribe_channel("c1").await.unwrap();
    wait_for_held_read(&store).await;

    messages.mark_read("c1", "m1").await.unwrap();
    write(&messages, "c1", "m2", "new", 2).await;
    messages.mark_read("c1", "m2").await.unwrap();
    messages.remove_message("c1", "m1").await.unwrap();
    store.release_reads();

    let events = next_events(&mut rx, 5).await;
    let kinds: Vec<(&str, &str)> = events
        .iter()
        .map(|event| {
            let kind = match event {
                MessageEvent::Added(_) => "added",
                MessageEvent::Changed(_) => "changed",
                MessageEvent::Removed(_) => "removed",
            };
            (kind, event.id())
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            ("added", "m1"),
            ("changed", "m1"),
            ("added", "m2"),
            ("changed", "m2"),
            ("removed", "m1"),
        ]
    );
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_live_redelivered_added_is_suppressed() {
    let (store, messages, manager) = setup();
    let mut rx = manager.subscribe_channel("c1").await.unwrap();
    assert!(manager.wait_for_state("c1", SubscriptionState::Live).await);

    write(&messages, "c1", "m1", "hi", 1).await;
    assert_eq!(next_event(&mut rx).await.id(), "m1");

    let path = StorePath::chat_messages("chats", "c1").unwrap();
    store.inject_event(
        &path,
        ChildEventKind::Added,
        "m1",
        json!({"id": "m1", "chatId": "c1", "text": "hi", "read": false, "createdAtMs": 1}),
    );
    write(&messages, "c1", "m2", "next", 2).await;

    assert_eq!(next_event(&mut rx).await.id(), "m2");
    assert_quiet(&mut rx).await;
    assert_eq!(messages.metrics().duplicates_suppressed_total.get(), 1);
}

#[tokio::test]
async fn test_malformed_records_never_delivered() {
    let (store, messages, manager) = setup();
    let path = StorePath::chat_messages("chats", "c1").unwrap();
    assert_ok!(
        store
            .set(&path.child("bad").unwrap(), json!({"text": "no id"}))
            .await
    );
    write(&messages, "c1", "good", "ok", 1).await;

    let mut rx = manager.subscribe_channel("c1").await.unwrap();
    assert_eq!(next_event(&mut rx).await.id(), "good");
    assert!(manager.wait_for_state("c1", SubscriptionState::Live).await);

    store.inject_event(&path, ChildEventKind::Added, "bad2", json!({"text": "still no id"}));
    store.inject_event(&path, ChildEventKind::Changed, "bad3", json!(42));
    assert_quiet(&mut rx).await;
    assert!(messages.metrics().malformed_records_total.get() >= 3);
}

#[tokio::test]
async fn test_resubscribe_starts_with_fresh_ledger() {
    let (store, messages, manager) = setup();
    write(&messages, "c1", "m1", "hi", 1).await;

    let mut first = manager.subscribe_channel("c1").await.unwrap();
    assert_eq!(next_event(&mut first).await.id(), "m1");

    let mut second = manager.subscribe_channel("c1").await.unwrap();
    assert_eq!(next_event(&mut second).await.id(), "m1");
    assert!(first.recv().await.is_none());

    let path = StorePath::chat_messages("chats", "c1").unwrap();
    assert_eq!(store.listener_count(&path), 3);
    assert_eq!(manager.active_chats().await, vec!["c1"]);
}

#[tokio::test]
async fn test_independent_managers_share_a_store() {
    let (store, messages, first) = setup();
    let second = SubscriptionManager::new(MessageStore::new(store.clone()));

    let mut a = first.subscribe_channel("c1").await.unwrap();
    let mut b = second.subscribe_channel("c1").await.unwrap();
    assert!(first.wait_for_state("c1", SubscriptionState::Live).await);
    assert!(second.wait_for_state("c1", SubscriptionState::Live).await);

    write(&messages, "c1", "m1", "hi", 1).await;
    assert_eq!(next_event(&mut a).await.id(), "m1");
    assert_eq!(next_event(&mut b).await.id(), "m1");

    first.stop("c1").await;
    write(&messages, "c1", "m2", "only b", 2).await;
    assert_eq!(next_event(&mut b).await.id(), "m2");
    assert!(a.recv().await.is_none());

    second.stop_all().await;
    let path = StorePath::chat_messages("chats", "c1").unwrap();
    assert_eq!(store.listener_count(&path), 0);
}

#[tokio::test]
async fn test_chats_are_isolated() {
    let (_, messages, manager) = setup();
    let mut c1 = manager.subscribe_channel("c1").await.unwrap();
    let mut c2 = manager.subscribe_channel("c2").await.unwrap();
    assert!(manager.wait_for_state("c1", SubscriptionState::Live).await);
    assert!(manager.wait_for_state("c2", SubscriptionState::Live).await);

    write(&messages, "c2", "m1", "for c2", 1).await;
    assert_eq!(next_event(&mut c2).await.message().chat_id, "c2");
    assert_quiet(&mut c1).await;

    manager.stop("c2").await;
    assert_eq!(manager.active_chats().await, vec!["c1"]);
}
