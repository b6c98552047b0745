//! 调度器。给正在下载的 peer 挑选父节点和候补，
//! 反复挑不到时按策略退到回源或者宣告失败。

pub mod evaluator;

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use diaodu_util::sync::MutexExt;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::protocol::{Code, DestPeer, PeerPacket};
use crate::resource::Registries;
use crate::resource::peer::{Peer, PeerEvent, PeerState};
use crate::resource::task::{Task, TaskEvent, TaskState};
use crate::scheduler::evaluator::Evaluator;

/// 推给客户端的并发下载数
const PARALLEL_COUNT: u32 = 4;

pub struct Scheduler {
    config: Config,

    registries: Arc<Registries>,

    evaluator: Arc<dyn Evaluator>,
}

impl Scheduler {
    pub fn new(config: Config, registries: Arc<Registries>) -> Self {
        let evaluator = evaluator::new_evaluator(config.algorithm(), registries.clone());
        Self {
            config,
            registries,
            evaluator,
        }
    }

    /// 调度主入口。最多重试 retry_limit 次；重试到 retry_back_to_source_limit
    /// 或最近的种子 peer 已经失败时，允许的话让 peer 回源
    pub async fn schedule_parent(
        &self,
        cancel: &CancellationToken,
        peer: &Arc<Peer>,
        blocklist: HashSet<String>,
    ) {
        let mut n: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let Some(task) = self.registries.tasks().get(peer.task_id()) else {
                warn!("peer {} 的任务已不存在，停止调度", peer.id());
                return;
            };

            // 调度次数到了回源线，或者最近一次做种的种子 peer 已经失败，
            // 且任务回源名额还有富余，就让 peer 回源
            let seed_failed = task
                .seed_peer_id()
                .and_then(|id| self.registries.peers().get(&id))
                .map(|seed| seed.is(PeerState::Failed))
                .unwrap_or(false);
            if (n >= self.config.retry_back_to_source_limit() || seed_failed)
                && task.can_back_to_source()
            {
                info!("peer {} 调度 {n} 次后转为回源", peer.id());
                self.notify_back_to_source(&task, peer).await;
                return;
            }

            if n >= self.config.retry_limit() {
                info!("peer {} 调度超过 {} 次上限，通知失败", peer.id(), n);
                if let Err(e) = peer
                    .send_packet(PeerPacket::with_code(
                        task.id(),
                        peer.id(),
                        Code::SchedTaskStatusError,
                    ))
                    .await
                {
                    warn!("通知 peer {} 调度失败出错: {}", peer.id(), e);
                }
                return;
            }

            let (_, ok) = self.notify_and_find_parent(peer, &blocklist).await;
            if ok {
                return;
            }
            n += 1;
            debug!("peer {} 第 {n} 次调度失败", peer.id());

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(self.config.retry_interval()) => {}
            }
        }
    }

    /// 通知 peer 回源并完成相应迁移
    pub(crate) async fn notify_back_to_source(&self, task: &Arc<Task>, peer: &Arc<Peer>) {
        if let Err(e) = peer
            .send_packet(PeerPacket::with_code(
                task.id(),
                peer.id(),
                Code::SchedNeedBackSource,
            ))
            .await
        {
            warn!("通知 peer {} 回源出错: {}", peer.id(), e);
            return;
        }
        info!("peer {} 转为回源下载", peer.id());

        if let Err(e) = self
            .registries
            .peer_transit(peer, PeerEvent::DownloadFromBackToSource)
        {
            warn!("peer {} 回源迁移被拒: {}", peer.id(), e);
            return;
        }

        // 任务已经失败的话，由回源 peer 重新拉起
        if task.is(TaskState::Failed) {
            if let Err(e) = task.transit(TaskEvent::Download) {
                warn!("task {} 重新拉起失败: {}", task.id(), e);
            }
        }
    }

    /// 单次调度：筛选、评分、换父、推包。
    /// 返回 (选中的父节点 + 候补列表, 是否成功)
    pub async fn notify_and_find_parent(
        &self,
        peer: &Arc<Peer>,
        blocklist: &HashSet<String>,
    ) -> (Vec<Arc<Peer>>, bool) {
        // 只有 Running 状态需要调度，BackToSource 等状态都已经有了去处
        if !peer.is(PeerState::Running) {
            debug!("peer {} 状态是 {:?}，不调度", peer.id(), peer.state());
            return (Vec::new(), false);
        }
        let Some(task) = self.registries.tasks().get(peer.task_id()) else {
            return (Vec::new(), false);
        };

        let parents = self.sorted_candidates(peer, &task, blocklist);
        if parents.is_empty() {
            debug!("peer {} 找不到候选父节点", peer.id());
            return (Vec::new(), false);
        }

        if let Err(e) = self.registries.replace_parent(peer, &parents[0]) {
            warn!("peer {} 挂到 {} 下失败: {}", peer.id(), parents[0].id(), e);
            return (Vec::new(), false);
        }

        let packet = self.success_packet(peer, &parents[0], &parents[1..]);
        if let Err(e) = peer.send_packet(packet).await {
            warn!("给 peer {} 推调度包失败: {}", peer.id(), e);
            return (Vec::new(), false);
        }

        info!("peer {} 调度到父节点 {}", peer.id(), parents[0].id());
        (parents, true)
    }

    /// 单次筛选评分，不通知、不改图。给 GC 和管理面用
    pub fn find_parent(
        &self,
        peer: &Arc<Peer>,
        blocklist: &HashSet<String>,
    ) -> Option<Arc<Peer>> {
        let task = self.registries.tasks().get(peer.task_id())?;
        self.sorted_candidates(peer, &task, blocklist).into_iter().next()
    }

    /// 筛掉不合格候选后按评分降序
    fn sorted_candidates(
        &self,
        peer: &Arc<Peer>,
        task: &Arc<Task>,
        blocklist: &HashSet<String>,
    ) -> Vec<Arc<Peer>> {
        let candidates = self.filter_parents(peer, task, blocklist);
        if candidates.is_empty() {
            return candidates;
        }

        let total = task.total_piece_count();
        let mut scored: Vec<(f64, Arc<Peer>)> = candidates
            .into_iter()
            .map(|candidate| (self.evaluator.evaluate(&candidate, peer, total), candidate))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        scored.into_iter().map(|(_, candidate)| candidate).collect()
    }

    fn filter_parents(
        &self,
        peer: &Arc<Peer>,
        task: &Arc<Task>,
        blocklist: &HashSet<String>,
    ) -> Vec<Arc<Peer>> {
        let filter_limit = self.config.filter_parent_count();
        let depth_limit = self.config.depth_limit();

        let ids: Vec<String> = task.peers().iter().map(|id| id.clone()).collect();
        let dag = task.dag().lock_pe();

        let mut candidates = Vec::new();
        for id in ids {
            if candidates.len() >= filter_limit {
                break;
            }
            if id == peer.id() || blocklist.contains(&id) || peer.block_peers().contains(&id) {
                continue;
            }
            let Some(candidate) = self.registries.peers().get(&id) else {
                continue;
            };
            if self.evaluator.is_bad_node(&candidate) {
                debug!("候选 {id} 是坏节点，跳过");
                continue;
            }
            // 深度已经到顶的节点不能再往下挂
            if dag.depth(&id) >= depth_limit {
                continue;
            }
            // 已经在 peer 子树里，或者在 peer 的祖先链上，挂上去都会出问题
            if dag.is_descendant(&id, peer.id()) || dag.is_ancestor(&id, peer.id()) {
                continue;
            }
            let free_slots = self
                .registries
                .hosts()
                .get(candidate.host_id())
                .map(|host| host.free_upload_slots())
                .unwrap_or(0);
            if free_slots == 0 {
                continue;
            }
            candidates.push(candidate);
        }
        candidates
    }

    /// 组装调度成功的包：主父节点 + 候补
    pub fn success_packet(
        &self,
        peer: &Arc<Peer>,
        parent: &Arc<Peer>,
        candidates: &[Arc<Peer>],
    ) -> PeerPacket {
        PeerPacket {
            task_id: peer.task_id().to_string(),
            src_pid: peer.id().to_string(),
            parallel_count: PARALLEL_COUNT,
            main_peer: self.dest_peer(parent),
            steal_peers: candidates.iter().filter_map(|c| self.dest_peer(c)).collect(),
            code: Code::Success,
        }
    }

    fn dest_peer(&self, peer: &Arc<Peer>) -> Option<DestPeer> {
        let host = self.registries.hosts().get(peer.host_id())?;
        let endpoint = host.endpoint();
        Some(DestPeer {
            ip: endpoint.ip,
            rpc_port: endpoint.rpc_port,
            peer_id: peer.id().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::protocol::{HostInfo, HostType, UrlMeta};

    fn setup() -> (Arc<Registries>, Scheduler) {
        let config = Config::new();
        let registries = Arc::new(Registries::new(config.clone()));
        let scheduler = Scheduler::new(config, registries.clone());
        (registries, scheduler)
    }

    fn add_host(r: &Registries, id: &str, host_type: HostType) {
        r.hosts().upsert(&HostInfo {
            id: id.to_string(),
            ip: "127.0.0.1".to_string(),
            rpc_port: 8001,
            host_type,
            ..Default::default()
        });
    }

    /// 建一个 Running 状态、绑定了上报流的 peer
    fn add_running_peer(
        r: &Registries,
        peer_id: &str,
        host_id: &str,
    ) -> (Arc<Peer>, mpsc::Receiver<PeerPacket>) {
        add_host(r, host_id, HostType::Client);
        let (task, _) = r.tasks().get_or_insert("t1", "http://x/1", &UrlMeta::default(), 3);
        let (peer, _) = r.peers().get_or_insert(Peer::new(peer_id, "t1", host_id));
        task.add_peer(peer_id);
        r.hosts().add_peer(host_id, peer_id).unwrap();
        peer.transit(PeerEvent::RegisterNormal).unwrap();
        peer.transit(PeerEvent::Download).unwrap();
        let (tx, rx) = mpsc::channel(8);
        peer.register_stream(tx);
        (peer, rx)
    }

    #[tokio::test]
    async fn test_notify_and_find_parent() {
        let (r, scheduler) = setup();
        let (p1, _rx1) = add_running_peer(&r, "p1", "h1");
        let (p2, mut rx2) = add_running_peer(&r, "p2", "h2");

        let (parents, ok) = scheduler.notify_and_find_parent(&p2, &HashSet::new()).await;
        assert!(ok);
        assert_eq!(parents[0].id(), "p1");
        assert_eq!(r.parent_of(&p2).unwrap().id(), "p1");

        let packet = rx2.recv().await.unwrap();
        assert_eq!(packet.code, Code::Success);
        assert_eq!(packet.main_peer.unwrap().peer_id, "p1");
        drop(p1);
    }

    #[tokio::test]
    async fn test_not_running_peer_rejected() {
        let (r, scheduler) = setup();
        let (_p1, _rx1) = add_running_peer(&r, "p1", "h1");

        add_host(&r, "h2", HostType::Client);
        let (task, _) = r.tasks().get_or_insert("t1", "http://x/1", &UrlMeta::default(), 3);
        let (pending, _) = r.peers().get_or_insert(Peer::new("p2", "t1", "h2"));
        task.add_peer("p2");

        let (_, ok) = scheduler.notify_and_find_parent(&pending, &HashSet::new()).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_descendant_not_selected() {
        let (r, scheduler) = setup();
        let (p1, _rx1) = add_running_peer(&r, "p1", "h1");
        let (p2, _rx2) = add_running_peer(&r, "p2", "h2");
        let (p3, _rx3) = add_running_peer(&r, "p3", "h3");

        // 链 p1 -> p2 -> p3
        r.replace_parent(&p2, &p1).unwrap();
        r.replace_parent(&p3, &p2).unwrap();

        // p1 调度时唯一的候选是自己的后代，必须一个都选不出来
        let (_, ok) = scheduler.notify_and_find_parent(&p1, &HashSet::new()).await;
        assert!(!ok);
        assert!(r.parent_of(&p1).is_none());
        drop(p3);
    }

    #[tokio::test]
    async fn test_blocklist_respected() {
        let (r, scheduler) = setup();
        let (_p1, _rx1) = add_running_peer(&r, "p1", "h1");
        let (p2, _rx2) = add_running_peer(&r, "p2", "h2");

        let blocklist: HashSet<String> = ["p1".to_string()].into();
        let (_, ok) = scheduler.notify_and_find_parent(&p2, &blocklist).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_depth_limit_respected() {
        let config = Config::new().set_depth_limit(2);
        let registries = Arc::new(Registries::new(config.clone()));
        let scheduler = Scheduler::new(config, registries.clone());

        let (p1, _rx1) = add_running_peer(&registries, "p1", "h1");
        let (p2, _rx2) = add_running_peer(&registries, "p2", "h2");
        let (p3, _rx3) = add_running_peer(&registries, "p3", "h3");
        registries.replace_parent(&p2, &p1).unwrap();

        // p2 深度已到上限 2，p3 只能挂 p1
        let blocklist: HashSet<String> = ["p1".to_string()].into();
        let (_, ok) = scheduler.notify_and_find_parent(&p3, &blocklist).await;
        assert!(!ok);

        let (parents, ok) = scheduler.notify_and_find_parent(&p3, &HashSet::new()).await;
        assert!(ok);
        assert_eq!(parents[0].id(), "p1");
    }

    #[tokio::test]
    async fn test_find_parent_no_side_effect() {
        let (r, scheduler) = setup();
        let (_p1, _rx1) = add_running_peer(&r, "p1", "h1");
        let (p2, _rx2) = add_running_peer(&r, "p2", "h2");

        let best = scheduler.find_parent(&p2, &HashSet::new()).unwrap();
        assert_eq!(best.id(), "p1");
        // 不通知也不改图
        assert!(r.parent_of(&p2).is_none());
    }
}
