//! 资源层：主机 / 任务 / peer 三张注册表的聚合。
//! 启动时构造一次，整个进程按引用传递。实体之间只存 id，
//! 跨实体的级联操作（删除、换父、状态迁移副作用）都收口在这里。

pub mod dag;
pub mod host;
pub mod peer;
pub mod task;

use std::sync::Arc;

use diaodu_util::fsm::{FsmError, Transition};
use diaodu_util::sync::MutexExt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::resource::dag::DagError;
use crate::resource::host::HostRegistry;
use crate::resource::peer::{Peer, PeerEvent, PeerRegistry, PeerState};
use crate::resource::task::TaskRegistry;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("host {0} not found")]
    HostNotFound(String),

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("peer {0} not found")]
    PeerNotFound(String),

    #[error(transparent)]
    Dag(#[from] DagError),
}

pub struct Registries {
    hosts: HostRegistry,
    tasks: TaskRegistry,
    peers: PeerRegistry,
}

impl Registries {
    pub fn new(config: Config) -> Self {
        Self {
            hosts: HostRegistry::new(config),
            tasks: TaskRegistry::new(),
            peers: PeerRegistry::new(),
        }
    }

    pub fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// 级联删除 peer：摘出 arena、脱离主机和任务、切断图上的边、
    /// 释放相关上传槽、关掉上报流。对不存在的 peer 是空操作
    pub fn delete_peer(&self, peer_id: &str) {
        let Some(peer) = self.peers.remove(peer_id) else {
            return;
        };
        peer.close_stream();

        let _ = self.hosts.delete_peer(peer.host_id(), peer_id);

        if let Some(task) = self.tasks.get(peer.task_id()) {
            let (freed_parent, orphans) = task.delete_peer(peer_id);
            // 入边释放的是父节点主机的上传槽
            if let Some(parent_id) = freed_parent {
                self.release_upload_of(&parent_id);
            }
            // 出边释放的是自己主机的上传槽
            if let Some(host) = self.hosts.get(peer.host_id()) {
                for _ in &orphans {
                    host.dec_upload();
                }
            }
        }
        debug!("peer {peer_id} 已从注册表移除");
    }

    /// 原子地把 child 的父节点换成 parent：先切断旧入边，再挂新边。
    /// 成环、重复挂父等情况原样返回图层错误
    pub fn replace_parent(&self, child: &Arc<Peer>, parent: &Arc<Peer>) -> Result<(), ResourceError> {
        let task = self
            .tasks
            .get(child.task_id())
            .ok_or_else(|| ResourceError::TaskNotFound(child.task_id().to_string()))?;

        {
            let mut dag = task.dag().lock_pe();
            if let Some(old_parent) = dag.remove_in_edge(child.id()) {
                self.release_upload_of(&old_parent);
            }
            dag.add_edge(parent.id(), child.id())?;
        }

        if let Some(host) = self.hosts.get(parent.host_id()) {
            host.inc_upload();
        }
        Ok(())
    }

    /// 切断 child 的入边。没有父节点时是空操作
    pub fn delete_parent(&self, child: &Peer) {
        let Some(task) = self.tasks.get(child.task_id()) else {
            return;
        };
        let old_parent = task.dag().lock_pe().remove_in_edge(child.id());
        if let Some(old_parent) = old_parent {
            self.release_upload_of(&old_parent);
        }
    }

    pub fn parent_of(&self, peer: &Peer) -> Option<Arc<Peer>> {
        let task = self.tasks.get(peer.task_id())?;
        let parent_id = task.dag().lock_pe().parent_of(peer.id()).map(|p| p.to_string())?;
        self.peers.get(&parent_id)
    }

    pub fn children_of(&self, peer: &Peer) -> Vec<Arc<Peer>> {
        let Some(task) = self.tasks.get(peer.task_id()) else {
            return Vec::new();
        };
        let children = task.dag().lock_pe().children_of(peer.id());
        children.iter().filter_map(|id| self.peers.get(id)).collect()
    }

    /// peer 状态迁移的唯一入口，迁移成功后执行跨实体副作用。
    /// 事件 worker 按任务串行调用，不存在并发改图
    pub fn peer_transit(
        &self,
        peer: &Arc<Peer>,
        event: PeerEvent,
    ) -> Result<Transition<PeerState, PeerEvent>, FsmError<PeerState, PeerEvent>> {
        let transition = peer.transit(event)?;
        let task = self.tasks.get(peer.task_id());

        match transition.to {
            PeerState::BackToSource => {
                peer.set_back_to_source();
                if let Some(task) = &task {
                    task.add_back_to_source_peer(peer.id());
                }
                self.delete_parent(peer);
            }
            PeerState::Succeeded => {
                if let Some(task) = &task {
                    if transition.from == PeerState::BackToSource {
                        task.delete_back_to_source_peer(peer.id());
                    }
                    task.reset_peer_failed_count();
                }
                self.delete_parent(peer);
            }
            PeerState::Failed => {
                if let Some(task) = &task {
                    if transition.from == PeerState::BackToSource {
                        task.inc_peer_failed_count();
                        task.delete_back_to_source_peer(peer.id());
                    }
                }
                self.delete_parent(peer);
            }
            PeerState::Leave => {
                self.delete_parent(peer);
                peer.close_stream();
            }
            _ => {}
        }
        Ok(transition)
    }

    /// 释放某个 peer 所在主机的一个上传槽。peer 已经不在时跳过，
    /// 它的槽位在级联删除时已经清算过了
    fn release_upload_of(&self, peer_id: &str) {
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };
        match self.hosts.get(peer.host_id()) {
            Some(host) => host.dec_upload(),
            None => warn!("peer {peer_id} 的主机 {} 不存在，无法释放上传槽", peer.host_id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HostInfo, UrlMeta};

    fn registries() -> Registries {
        Registries::new(Config::new())
    }

    fn setup_peer(r: &Registries, peer_id: &str, host_id: &str, task_id: &str) -> Arc<Peer> {
        r.hosts.upsert(&HostInfo {
            id: host_id.to_string(),
            ip: "127.0.0.1".to_string(),
            ..Default::default()
        });
        let (task, _) = r.tasks.get_or_insert(task_id, "http://x/1", &UrlMeta::default(), 3);
        let (peer, _) = r.peers.get_or_insert(Peer::new(peer_id, task_id, host_id));
        task.add_peer(peer_id);
        r.hosts.add_peer(host_id, peer_id).unwrap();
        peer
    }

    #[test]
    fn test_replace_parent_accounting() {
        let r = registries();
        let p1 = setup_peer(&r, "p1", "h1", "t1");
        let p2 = setup_peer(&r, "p2", "h2", "t1");
        let p3 = setup_peer(&r, "p3", "h3", "t1");

        r.replace_parent(&p2, &p1).unwrap();
        let h1 = r.hosts.get("h1").unwrap();
        assert_eq!(h1.free_upload_slots(), h1.upload_limit() - 1);

        // 换父：旧父的槽位还回去，新父占一个
        r.replace_parent(&p2, &p3).unwrap();
        assert_eq!(h1.free_upload_slots(), h1.upload_limit());
        let h3 = r.hosts.get("h3").unwrap();
        assert_eq!(h3.free_upload_slots(), h3.upload_limit() - 1);
    }

    #[test]
    fn test_replace_parent_rejects_cycle() {
        let r = registries();
        let p1 = setup_peer(&r, "p1", "h1", "t1");
        let p2 = setup_peer(&r, "p2", "h2", "t1");

        r.replace_parent(&p2, &p1).unwrap();
        // p1 的父节点不能是自己的后代
        assert!(matches!(
            r.replace_parent(&p1, &p2),
            Err(ResourceError::Dag(DagError::Cycle { .. }))
        ));
    }

    #[test]
    fn test_delete_peer_cascades() {
        let r = registries();
        let p1 = setup_peer(&r, "p1", "h1", "t1");
        let p2 = setup_peer(&r, "p2", "h2", "t1");
        r.replace_parent(&p2, &p1).unwrap();

        r.delete_peer("p1");

        assert!(r.peers.get("p1").is_none());
        let task = r.tasks.get("t1").unwrap();
        assert!(!task.peers().contains("p1"));
        assert!(!task.dag().lock().unwrap().contains("p1"));
        // p2 失去父节点，p1 主机的上传槽清零
        assert!(r.parent_of(&p2).is_none());
        let h1 = r.hosts.get("h1").unwrap();
        assert_eq!(h1.free_upload_slots(), h1.upload_limit());
        // 再删一次是空操作
        r.delete_peer("p1");
    }

    #[test]
    fn test_terminal_transit_detaches() {
        let r = registries();
        let p1 = setup_peer(&r, "p1", "h1", "t1");
        let p2 = setup_peer(&r, "p2", "h2", "t1");
        r.replace_parent(&p2, &p1).unwrap();

        p2.transit(PeerEvent::RegisterNormal).unwrap();
        p2.transit(PeerEvent::Download).unwrap();
        r.peer_transit(&p2, PeerEvent::DownloadSucceeded).unwrap();

        assert!(r.parent_of(&p2).is_none());
        let h1 = r.hosts.get("h1").unwrap();
        assert_eq!(h1.free_upload_slots(), h1.upload_limit());
    }

    #[test]
    fn test_back_to_source_transit() {
        let r = registries();
        let p1 = setup_peer(&r, "p1", "h1", "t1");
        let p2 = setup_peer(&r, "p2", "h2", "t1");
        r.replace_parent(&p2, &p1).unwrap();

        p2.transit(PeerEvent::RegisterNormal).unwrap();
        p2.transit(PeerEvent::Download).unwrap();
        r.peer_transit(&p2, PeerEvent::DownloadFromBackToSource).unwrap();

        let task = r.tasks.get("t1").unwrap();
        assert!(task.is_back_to_source_peer("p2"));
        assert!(p2.is_back_to_source());
        // 回源后脱离父节点，但 p2 仍然是图上的顶点（还能当别人的父节点）
        assert!(r.parent_of(&p2).is_none());
        assert!(task.dag().lock().unwrap().contains("p2"));
    }
}
