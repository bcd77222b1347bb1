//! 投递去重账本
//!
//! 记录某个订阅已经通过 `on_added` 投递过的消息ID。只有新增事件查账，
//! 变更与删除事件总是放行。账本随订阅生命周期存在，停止订阅即丢弃。

use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct DeliveryLedger {
    delivered: HashSet<String>,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一次投递；首次出现返回 true，重复返回 false
    pub fn first_delivery(&mut self, message_id: &str) -> bool {
        if self.delivered.contains(message_id) {
            return false;
        }
        self.delivered.insert(message_id.to_string())
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.delivered.contains(message_id)
    }

    pub fn len(&self) -> usize {
        self.delivered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delivered.is_empty()
    }

    pub fn clear(&mut self) {
        self.delivered.clear();
    }
}
