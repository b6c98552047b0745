use std::time::{SystemTime, UNIX_EPOCH};

/// 获取当前时间戳（秒）
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// 获取当前时间戳（毫秒）
///
/// 用 u64 存储，方便放进 AtomicU64。到 2262 年才会溢出，不用管。
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
