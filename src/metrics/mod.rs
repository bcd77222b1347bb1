//! # Prometheus 指标收集模块
//!
//! 聊天同步层的投递、去重、缓冲和快照读取指标。

use std::sync::Arc;

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// 全局指标注册表
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// 进程级默认指标，注册到 [`REGISTRY`]，所有默认构造的存储适配器共用
static SHARED: Lazy<Arc<ChatSyncMetrics>> = Lazy::new(|| {
    let metrics = ChatSyncMetrics::new();
    if let Err(err) = metrics.register(&REGISTRY) {
        tracing::warn!(error = %err, "Failed to register chat sync metrics");
    }
    Arc::new(metrics)
});

/// 聊天同步指标
pub struct ChatSyncMetrics {
    /// 投递给订阅者的事件数（按 added/changed/removed）
    pub events_delivered_total: IntCounterVec,
    /// 被账本拦截的重复新增事件数
    pub duplicates_suppressed_total: IntCounter,
    /// 快照在途期间缓冲的事件数
    pub events_buffered_total: IntCounter,
    /// 快照读取失败次数
    pub snapshot_failures_total: IntCounter,
    /// 被跳过的畸形记录数
    pub malformed_records_total: IntCounter,
    /// 当前活跃订阅数
    pub active_subscriptions: IntGauge,
    /// 快照读取耗时（秒）
    pub snapshot_duration_seconds: Histogram,
}

impl ChatSyncMetrics {
    /// 进程级共享实例，其计数会出现在 [`gather_text`] 的导出中
    pub fn shared() -> Arc<Self> {
        SHARED.clone()
    }

    /// 独立实例，不注册到任何注册表
    ///
    /// 需要导出时调用 [`ChatSyncMetrics::register`] 挂到自己的注册表上
    pub fn new() -> Self {
        let events_delivered_total = IntCounterVec::new(
            Opts::new(
                "chat_sync_events_delivered_total",
                "Total number of events delivered to subscribers",
            ),
            &["kind"],
        )
        .expect("Failed to create chat_sync_events_delivered_total metric");

        let duplicates_suppressed_total = IntCounter::new(
            "chat_sync_duplicates_suppressed_total",
            "Total number of duplicate added events suppressed by the ledger",
        )
        .expect("Failed to create chat_sync_duplicates_suppressed_total metric");

        let events_buffered_total = IntCounter::new(
            "chat_sync_events_buffered_total",
            "Total number of events buffered while the snapshot read was in flight",
        )
        .expect("Failed to create chat_sync_events_buffered_total metric");

        let snapshot_failures_total = IntCounter::new(
            "chat_sync_snapshot_failures_total",
            "Total number of failed snapshot reads",
        )
        .expect("Failed to create chat_sync_snapshot_failures_total metric");

        let malformed_records_total = IntCounter::new(
            "chat_sync_malformed_records_total",
            "Total number of message records skipped for missing id",
        )
        .expect("Failed to create chat_sync_malformed_records_total metric");

        let active_subscriptions = IntGauge::new(
            "chat_sync_active_subscriptions",
            "Number of active chat subscriptions",
        )
        .expect("Failed to create chat_sync_active_subscriptions metric");

        let snapshot_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "chat_sync_snapshot_duration_seconds",
                "Snapshot read duration in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .expect("Failed to create chat_sync_snapshot_duration_seconds metric");

        Self {
            events_delivered_total,
            duplicates_suppressed_total,
            events_buffered_total,
            snapshot_failures_total,
            malformed_records_total,
            active_subscriptions,
            snapshot_duration_seconds,
        }
    }

    /// 把全部指标注册到给定注册表，同名指标已存在时返回错误
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.events_delivered_total.clone()))?;
        registry.register(Box::new(self.duplicates_suppressed_total.clone()))?;
        registry.register(Box::new(self.events_buffered_total.clone()))?;
        registry.register(Box::new(self.snapshot_failures_total.clone()))?;
        registry.register(Box::new(self.malformed_records_total.clone()))?;
        registry.register(Box::new(self.active_subscriptions.clone()))?;
        registry.register(Box::new(self.snapshot_duration_seconds.clone()))?;
        Ok(())
    }

    pub fn delivered(&self, kind: &str) -> u64 {
        self.events_delivered_total.with_label_values(&[kind]).get()
    }
}

impl Default for ChatSyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 以 Prometheus 文本格式导出全局注册表
pub fn gather_text() -> String {
    encode_text(&REGISTRY)
}

/// 以 Prometheus 文本格式导出任意注册表
pub fn encode_text(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::warn!(error = %err, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 从导出文本中取出某个无标签指标的值
    fn exported(text: &str, name: &str) -> f64 {
        text.lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(' '))
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or_else(|| panic!("metric {name} missing from export"))
    }

    #[test]
    fn test_isolated_instances_do_not_share_counts() {
        let first = ChatSyncMetrics::new();
        let second = ChatSyncMetrics::new();

        first.events_delivered_total.with_label_values(&["added"]).inc();
        assert_eq!(first.delivered("added"), 1);
        assert_eq!(second.delivered("added"), 0);
    }

    #[test]
    fn test_shared_instance_is_exported() {
        let first = ChatSyncMetrics::shared();
        let second = ChatSyncMetrics::shared();
        assert!(Arc::ptr_eq(&first, &second));

        let before = first.snapshot_failures_total.get();
        second.snapshot_failures_total.inc_by(5);
        let text = gather_text();
        assert!(exported(&text, "chat_sync_snapshot_failures_total") >= (before + 5) as f64);
    }

    #[test]
    fn test_register_on_own_registry() {
        let registry = Registry::new();
        let metrics = ChatSyncMetrics::new();
        metrics.register(&registry).unwrap();
        metrics.active_subscriptions.set(3);

        let text = encode_text(&registry);
        assert_eq!(exported(&text, "chat_sync_active_subscriptions"), 3.0);

        // 同一注册表不能重复注册同名指标
        assert!(ChatSyncMetrics::new().register(&registry).is_err());
    }
}
