//! 主机注册表。一台主机可能承载多个 peer，上传槽计数挂在主机上。

use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use diaodu_util::datetime;
use diaodu_util::sync::RwLockExt;
use tracing::debug;

use crate::config::Config;
use crate::protocol::{HostInfo, HostType};
use crate::resource::ResourceError;

/// 主机的可变寻址信息，upsert 时整体覆盖
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub ip: String,
    pub rpc_port: u16,
    pub download_port: u16,
}

pub struct Host {
    id: String,

    endpoint: RwLock<Endpoint>,

    host_type: HostType,

    /// 机房
    idc: String,

    /// 地理位置，| 分隔逐级细化
    location: String,

    /// 网络拓扑，| 分隔逐级细化
    net_topology: String,

    /// 安全域，不同安全域之间不互通
    security_domain: String,

    /// 并发上传上限
    upload_limit: AtomicU32,

    /// 进行中的上传数
    upload_count: AtomicU32,

    /// 本机承载的 peer
    peers: DashSet<String>,

    last_access: AtomicU64,
}

impl Host {
    pub fn new(info: &HostInfo, default_limit: u32) -> Self {
        Self {
            id: info.id.clone(),
            endpoint: RwLock::new(Endpoint {
                ip: info.ip.clone(),
                rpc_port: info.rpc_port,
                download_port: info.download_port,
            }),
            host_type: info.host_type,
            idc: info.idc.clone(),
            location: info.location.clone(),
            net_topology: info.net_topology.clone(),
            security_domain: info.security_domain.clone(),
            upload_limit: AtomicU32::new(info.upload_limit.unwrap_or(default_limit)),
            upload_count: AtomicU32::new(0),
            peers: DashSet::new(),
            last_access: AtomicU64::new(datetime::now_millis()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.read_pe().clone()
    }

    pub fn host_type(&self) -> HostType {
        self.host_type
    }

    pub fn is_seed(&self) -> bool {
        self.host_type.is_seed()
    }

    pub fn idc(&self) -> &str {
        &self.idc
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn net_topology(&self) -> &str {
        &self.net_topology
    }

    pub fn security_domain(&self) -> &str {
        &self.security_domain
    }

    pub fn upload_limit(&self) -> u32 {
        self.upload_limit.load(Ordering::Acquire)
    }

    /// 空闲上传槽数量。与正在进行的选父判断之间允许短暂超卖
    pub fn free_upload_slots(&self) -> u32 {
        let limit = self.upload_limit.load(Ordering::Acquire);
        limit.saturating_sub(self.upload_count.load(Ordering::Acquire))
    }

    pub fn inc_upload(&self) {
        self.upload_count.fetch_add(1, Ordering::AcqRel);
    }

    /// 减少上传计数，已经为 0 时是空操作
    pub fn dec_upload(&self) {
        let _ = self
            .upload_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
    }

    pub fn peers(&self) -> &DashSet<String> {
        &self.peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn touch(&self) {
        self.last_access.store(datetime::now_millis(), Ordering::Release);
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }
}

pub struct HostRegistry {
    hosts: DashMap<String, Arc<Host>>,
    config: Config,
}

impl HostRegistry {
    pub fn new(config: Config) -> Self {
        Self {
            hosts: DashMap::new(),
            config,
        }
    }

    fn default_limit(&self, host_type: HostType) -> u32 {
        if host_type.is_seed() {
            self.config.seed_upload_limit()
        } else {
            self.config.client_upload_limit()
        }
    }

    /// 创建或更新主机。已存在时覆盖寻址信息和上传上限，peer 集合保持不动
    pub fn upsert(&self, info: &HostInfo) -> Arc<Host> {
        if let Some(host) = self.hosts.get(&info.id) {
            let host = host.clone();
            *host.endpoint.write_pe() = Endpoint {
                ip: info.ip.clone(),
                rpc_port: info.rpc_port,
                download_port: info.download_port,
            };
            if let Some(limit) = info.upload_limit {
                host.upload_limit.store(limit, Ordering::Release);
            }
            host.touch();
            return host;
        }

        let host = Arc::new(Host::new(info, self.default_limit(info.host_type)));
        debug!("新主机注册: {} ({:?})", info.id, info.host_type);
        self.hosts.insert(info.id.clone(), host.clone());
        host
    }

    pub fn get(&self, host_id: &str) -> Option<Arc<Host>> {
        self.hosts.get(host_id).map(|h| h.clone())
    }

    pub fn delete(&self, host_id: &str) -> Option<Arc<Host>> {
        self.hosts.remove(host_id).map(|(_, host)| host)
    }

    pub fn list(&self) -> Vec<Arc<Host>> {
        self.hosts.iter().map(|h| h.clone()).collect()
    }

    pub fn add_peer(&self, host_id: &str, peer_id: &str) -> Result<(), ResourceError> {
        let host = self
            .get(host_id)
            .ok_or_else(|| ResourceError::HostNotFound(host_id.to_string()))?;
        host.peers.insert(peer_id.to_string());
        host.touch();
        Ok(())
    }

    pub fn delete_peer(&self, host_id: &str, peer_id: &str) -> Result<(), ResourceError> {
        let host = self
            .get(host_id)
            .ok_or_else(|| ResourceError::HostNotFound(host_id.to_string()))?;
        host.peers.remove(peer_id);
        host.touch();
        Ok(())
    }

    pub fn upload_slots(&self, host_id: &str) -> Result<u32, ResourceError> {
        let host = self
            .get(host_id)
            .ok_or_else(|| ResourceError::HostNotFound(host_id.to_string()))?;
        Ok(host.free_upload_slots())
    }
}
