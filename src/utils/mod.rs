//! 工具函数模块
//!
//! 提供毫秒时间戳与 ISO-8601 字符串之间的转换

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};

/// 获取当前时间戳（毫秒）
pub fn current_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 解析时间字符串为毫秒时间戳
///
/// 支持的格式：
/// - RFC 3339（`2024-05-01T10:00:00.123Z`、`2024-05-01T10:00:00+08:00`）
/// - 无时区的日期时间（`2024-05-01T10:00:00`、`2024-05-01 10:00:00.5`），按 UTC 处理
/// - 纯日期（`2024-05-01`），按 UTC 零点处理
///
/// # 示例
/// ```
/// use flare_chat_sync::utils::parse_timestamp_millis;
///
/// assert_eq!(parse_timestamp_millis("1970-01-01T00:00:01Z"), Some(1000));
/// assert_eq!(parse_timestamp_millis("not a date"), None);
/// ```
pub fn parse_timestamp_millis(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp_millis());
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// 毫秒时间戳转换为 RFC 3339 字符串（毫秒精度，`Z` 结尾）
///
/// 超出可表示范围的时间戳按 Unix 纪元处理
pub fn millis_to_rfc3339(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
