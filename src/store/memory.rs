//! 内存实时存储
//!
//! 子节点按键序保存（BTreeMap），与实时数据库默认的子节点顺序一致。
//! 额外提供若干控制开关，用于模拟读取在途、存储不可达以及事件重投。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace};

use super::{ChildEvent, ChildEventKind, ChildWatch, RealtimeStore, StorePath, WatchId};
use crate::error::{ChatSyncError, Result};

/// 监听注册条目
struct Watcher {
    path: StorePath,
    kind: ChildEventKind,
    tx: mpsc::UnboundedSender<ChildEvent>,
}

/// 挂起读取计数，读取被取消时同样归还
struct HeldRead<'a>(&'a AtomicUsize);

impl<'a> HeldRead<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for HeldRead<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 内存实时存储
pub struct MemoryStore {
    /// 父路径 -> (键 -> 值)
    nodes: DashMap<StorePath, BTreeMap<String, Value>>,
    watchers: DashMap<WatchId, Watcher>,
    next_watch_id: AtomicU64,
    next_seq: AtomicU64,
    /// 读取是否被挂起（快照已截取，结果延迟返回）
    reads_held: AtomicBool,
    read_release: Notify,
    /// 当前被挂起的读取数
    held_reads: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            watchers: DashMap::new(),
            next_watch_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            reads_held: AtomicBool::new(false),
            read_release: Notify::new(),
            held_reads: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// 挂起后续读取：读取在发起时截取快照，直到 `release_reads` 才返回
    pub fn hold_reads(&self) {
        self.reads_held.store(true, Ordering::SeqCst);
    }

    /// 放行所有被挂起的读取
    pub fn release_reads(&self) {
        self.reads_held.store(false, Ordering::SeqCst);
        self.read_release.notify_waiters();
    }

    /// 当前被挂起（快照已截取、尚未返回）的读取数
    pub fn held_reads(&self) -> usize {
        self.held_reads.load(Ordering::SeqCst)
    }

    /// 模拟读取失败（存储不可达）；在读取返回时判定
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// 模拟写入失败（无权限）
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// 某节点上仍然挂着的监听数
    pub fn listener_count(&self, path: &StorePath) -> usize {
        self.watchers
            .iter()
            .filter(|entry| &entry.value().path == path)
            .count()
    }

    /// 直接向监听者推送一条事件而不修改数据，用于模拟存储重投
    pub fn inject_event(&self, path: &StorePath, kind: ChildEventKind, key: &str, value: Value) {
        self.dispatch(path, kind, key, value);
    }

    async fn wait_for_release(&self) {
        loop {
            let notified = self.read_release.notified();
            if !self.reads_held.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    fn check_writable(&self, path: &StorePath) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ChatSyncError::PermissionDenied(format!(
                "write to {} rejected",
                path
            )));
        }
        Ok(())
    }

    /// 向匹配的监听者推送事件
    ///
    /// 调用方持有节点锁时调用，保证 seq 与数据变更顺序一致
    fn dispatch(&self, path: &StorePath, kind: ChildEventKind, key: &str, value: Value) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut closed = Vec::new();

        for entry in self.watchers.iter() {
            let watcher = entry.value();
            if watcher.kind != kind || &watcher.path != path {
                continue;
            }
            let event = ChildEvent {
                kind,
                key: key.to_string(),
                value: value.clone(),
                seq,
            };
            if watcher.tx.send(event).is_err() {
                closed.push(*entry.key());
            }
        }

        for id in closed {
            self.watchers.remove(&id);
        }

        trace!(path = %path, kind = %kind, key = %key, seq, "Child event dispatched");
    }
}

#[async_trait]
impl RealtimeStore for MemoryStore {
    async fn read_children(&self, path: &StorePath) -> Result<Vec<(String, Value)>> {
        let snapshot: Vec<(String, Value)> = self
            .nodes
            .get(path)
            .map(|children| {
                children
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();

        {
            let _held = HeldRead::enter(&self.held_reads);
            self.wait_for_release().await;
        }

        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ChatSyncError::StoreUnavailable(format!(
                "read of {} failed",
                path
            )));
        }

        Ok(snapshot)
    }

    async fn set(&self, path: &StorePath, value: Value) -> Result<()> {
        self.check_writable(path)?;
        let (parent, key) = path.split_child()?;

        let mut children = self.nodes.entry(parent.clone()).or_default();
        let kind = if children.insert(key.clone(), value.clone()).is_some() {
            ChildEventKind::Changed
        } else {
            ChildEventKind::Added
        };
        self.dispatch(&parent, kind, &key, value);
        Ok(())
    }

    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<()> {
        self.check_writable(path)?;
        let (parent, key) = path.split_child()?;

        let mut children = self
            .nodes
            .get_mut(&parent)
            .ok_or_else(|| ChatSyncError::NotFound(path.to_string()))?;
        let current = children
            .get_mut(&key)
            .ok_or_else(|| ChatSyncError::NotFound(path.to_string()))?;

        match &mut *current {
            Value::Object(existing) => {
                for (field, value) in fields {
                    existing.insert(field, value);
                }
            }
            other => *other = Value::Object(fields),
        }
        let updated = current.clone();
        self.dispatch(&parent, ChildEventKind::Changed, &key, updated);
        Ok(())
    }

    async fn remove(&self, path: &StorePath) -> Result<()> {
        self.check_writable(path)?;
        let (parent, key) = path.split_child()?;

        if let Some(mut children) = self.nodes.get_mut(&parent) {
            if let Some(previous) = children.remove(&key) {
                self.dispatch(&parent, ChildEventKind::Removed, &key, previous);
                return Ok(());
            }
        }
        debug!(path = %path, "Remove of missing key ignored");
        Ok(())
    }

    fn watch_children(&self, path: &StorePath, kind: ChildEventKind) -> ChildWatch {
        let id = WatchId(self.next_watch_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.insert(
            id,
            Watcher {
                path: path.clone(),
                kind,
                tx,
            },
        );
        debug!(path = %path, kind = %kind, watch_id = id.0, "Child watch attached");
        ChildWatch {
            id,
            kind,
            events: rx,
        }
    }

    fn unwatch(&self, id: WatchId) {
        if self.watchers.remove(&id).is_some() {
            debug!(watch_id = id.0, "Child watch detached");
        }
    }
}
