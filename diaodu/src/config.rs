use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::HostInfo;

// ===========================================================================
// 写死的配置值，一般也不会改的
// ===========================================================================

/// channel 大小
pub const CHANNEL_BUFFER: usize = 100;

/// tiny 文件阈值（字节），不超过它的内容直接塞进注册响应
pub const TINY_FILE_SIZE: i64 = 128;

/// 分片大小，内容不超过一个分片即按 small 档位处理
pub const PIECE_SIZE: i64 = 4 << 20;

/// peer 分片耗时环形队列的容量
pub const PIECE_COST_RING_LIMIT: usize = 20;

#[derive(Clone, Default)]
pub struct Config {
    inner: Arc<ConfigInner>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct ConfigInner {
    /// 单个 peer 调度重试上限，超过后放弃
    retry_limit: u32,

    /// 调度多少次失败后允许回源
    retry_back_to_source_limit: u32,

    /// 两次调度尝试之间的间隔
    retry_interval: Duration,

    /// 候选父节点的筛选数量上限
    filter_parent_count: usize,

    /// peer 树的深度上限
    depth_limit: usize,

    /// peer 空闲多久标记为僵尸
    peer_tti: Duration,

    /// peer 空闲多久强制移除
    peer_ttl: Duration,

    /// 任务没有 peer 之后多久移除
    task_ttl: Duration,

    /// 主机没有 peer 之后多久移除
    host_ttl: Duration,

    /// peer / task / host 三类 GC 的扫描间隔
    peer_gc_interval: Duration,
    task_gc_interval: Duration,
    host_gc_interval: Duration,

    /// 是否允许客户端回源
    client_back_source_enabled: bool,

    /// 单任务允许同时回源的 peer 数量
    back_to_source_count: u32,

    /// 事件分片 worker 数量，0 表示取 CPU 核数
    scheduler_worker_num: usize,

    /// 评分算法
    algorithm: String,

    /// 是否启用种子节点做种
    seed_enabled: bool,

    /// 启动时注册进来的种子主机
    seed_hosts: Vec<HostInfo>,

    /// 普通客户端主机的并发上传上限
    client_upload_limit: u32,

    /// 种子主机的并发上传上限
    seed_upload_limit: u32,

    /// tiny 文件直取的超时
    tiny_download_timeout: Duration,
}

impl Default for ConfigInner {
    fn default() -> Self {
        Self {
            retry_limit: 10,
            retry_back_to_source_limit: 5,
            retry_interval: Duration::from_millis(50),
            filter_parent_count: 4,
            depth_limit: 10,
            peer_tti: Duration::from_secs(60 * 60),
            peer_ttl: Duration::from_secs(24 * 60 * 60),
            task_ttl: Duration::from_secs(30 * 60),
            host_ttl: Duration::from_secs(6 * 60 * 60),
            peer_gc_interval: Duration::from_secs(10),
            task_gc_interval: Duration::from_secs(30 * 60),
            host_gc_interval: Duration::from_secs(6 * 60 * 60),
            client_back_source_enabled: true,
            back_to_source_count: 3,
            scheduler_worker_num: 0,
            algorithm: "default".to_string(),
            seed_enabled: true,
            seed_hosts: Vec::new(),
            client_upload_limit: 50,
            seed_upload_limit: 300,
            tiny_download_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_inner(inner: ConfigInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn inner(&self) -> &ConfigInner {
        &self.inner
    }

    pub fn retry_limit(&self) -> u32 {
        self.inner.retry_limit
    }

    pub fn retry_back_to_source_limit(&self) -> u32 {
        self.inner.retry_back_to_source_limit
    }

    pub fn retry_interval(&self) -> Duration {
        self.inner.retry_interval
    }

    pub fn filter_parent_count(&self) -> usize {
        self.inner.filter_parent_count
    }

    pub fn depth_limit(&self) -> usize {
        self.inner.depth_limit
    }

    pub fn peer_tti(&self) -> Duration {
        self.inner.peer_tti
    }

    pub fn peer_ttl(&self) -> Duration {
        self.inner.peer_ttl
    }

    pub fn task_ttl(&self) -> Duration {
        self.inner.task_ttl
    }

    pub fn host_ttl(&self) -> Duration {
        self.inner.host_ttl
    }

    pub fn peer_gc_interval(&self) -> Duration {
        self.inner.peer_gc_interval
    }

    pub fn task_gc_interval(&self) -> Duration {
        self.inner.task_gc_interval
    }

    pub fn host_gc_interval(&self) -> Duration {
        self.inner.host_gc_interval
    }

    pub fn client_back_source_enabled(&self) -> bool {
        self.inner.client_back_source_enabled
    }

    pub fn back_to_source_count(&self) -> u32 {
        self.inner.back_to_source_count
    }

    /// 事件分片 worker 数量，0 回退到 CPU 核数
    pub fn scheduler_worker_num(&self) -> usize {
        if self.inner.scheduler_worker_num > 0 {
            return self.inner.scheduler_worker_num;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn algorithm(&self) -> &str {
        &self.inner.algorithm
    }

    pub fn seed_enabled(&self) -> bool {
        self.inner.seed_enabled
    }

    pub fn seed_hosts(&self) -> &[HostInfo] {
        &self.inner.seed_hosts
    }

    pub fn client_upload_limit(&self) -> u32 {
        self.inner.client_upload_limit
    }

    pub fn seed_upload_limit(&self) -> u32 {
        self.inner.seed_upload_limit
    }

    pub fn tiny_download_timeout(&self) -> Duration {
        self.inner.tiny_download_timeout
    }

    pub fn set_retry_limit(mut self, retry_limit: u32) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.retry_limit = retry_limit;
        }
        self
    }

    pub fn set_retry_back_to_source_limit(mut self, limit: u32) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.retry_back_to_source_limit = limit;
        }
        self
    }

    pub fn set_retry_interval(mut self, interval: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.retry_interval = interval;
        }
        self
    }

    pub fn set_filter_parent_count(mut self, count: usize) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.filter_parent_count = count;
        }
        self
    }

    pub fn set_depth_limit(mut self, limit: usize) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.depth_limit = limit;
        }
        self
    }

    pub fn set_peer_tti(mut self, tti: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.peer_tti = tti;
        }
        self
    }

    pub fn set_peer_ttl(mut self, ttl: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.peer_ttl = ttl;
        }
        self
    }

    pub fn set_task_ttl(mut self, ttl: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.task_ttl = ttl;
        }
        self
    }

    pub fn set_host_ttl(mut self, ttl: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.host_ttl = ttl;
        }
        self
    }

    pub fn set_peer_gc_interval(mut self, interval: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.peer_gc_interval = interval;
        }
        self
    }

    pub fn set_task_gc_interval(mut self, interval: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.task_gc_interval = interval;
        }
        self
    }

    pub fn set_host_gc_interval(mut self, interval: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.host_gc_interval = interval;
        }
        self
    }

    pub fn set_client_back_source_enabled(mut self, enabled: bool) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.client_back_source_enabled = enabled;
        }
        self
    }

    pub fn set_back_to_source_count(mut self, count: u32) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.back_to_source_count = count;
        }
        self
    }

    pub fn set_scheduler_worker_num(mut self, num: usize) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.scheduler_worker_num = num;
        }
        self
    }

    pub fn set_algorithm<T: ToString>(mut self, algorithm: T) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.algorithm = algorithm.to_string();
        }
        self
    }

    pub fn set_seed_enabled(mut self, enabled: bool) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.seed_enabled = enabled;
        }
        self
    }

    pub fn set_seed_hosts(mut self, hosts: Vec<HostInfo>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.seed_hosts = hosts;
        }
        self
    }

    pub fn set_client_upload_limit(mut self, limit: u32) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.client_upload_limit = limit;
        }
        self
    }

    pub fn set_seed_upload_limit(mut self, limit: u32) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.seed_upload_limit = limit;
        }
        self
    }

    pub fn set_tiny_download_timeout(mut self, timeout: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.tiny_download_timeout = timeout;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new();
        assert_eq!(config.retry_limit(), 10);
        assert_eq!(config.retry_back_to_source_limit(), 5);
        assert_eq!(config.retry_interval(), Duration::from_millis(50));
        assert_eq!(config.filter_parent_count(), 4);
        assert_eq!(config.depth_limit(), 10);
        assert!(config.scheduler_worker_num() >= 1);
    }

    #[test]
    fn test_builder() {
        let config = Config::new()
            .set_retry_limit(3)
            .set_depth_limit(2)
            .set_client_back_source_enabled(false);
        assert_eq!(config.retry_limit(), 3);
        assert_eq!(config.depth_limit(), 2);
        assert!(!config.client_back_source_enabled());
    }
}
