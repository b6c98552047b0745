//! peer 注册表。peer 是某个客户端对某个任务的一次下载，
//! 注册表就是 id 寻址的 arena，Host / Task 里只存 peer id。

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use dashmap::{DashMap, DashSet};
use diaodu_util::bitfield::Bitfield;
use diaodu_util::collection::FixedQueue;
use diaodu_util::datetime;
use diaodu_util::fsm::{FsmError, Rule, StateMachine, Transition};
use diaodu_util::sync::MutexExt;
use tracing::{debug, warn};

use crate::config::PIECE_COST_RING_LIMIT;
use crate::protocol::{PeerPacket, PeerPacketSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Pending,

    /// 注册时定下的档位
    ReceivedTiny,
    ReceivedSmall,
    ReceivedNormal,

    /// 上报流已经打开，正在从其他 peer 下载
    Running,

    /// 被调度器要求回源。回源 peer 仍然可以作为别人的父节点
    BackToSource,

    Succeeded,
    Failed,

    /// 空闲超时被 GC 标记，等待 Leave。Leave 的前置状态
    Zombie,

    Leave,
}

impl PeerState {
    /// 终态不再参与调度，也不再接受下载类迁移
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PeerState::Succeeded | PeerState::Failed | PeerState::Zombie | PeerState::Leave
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    RegisterTiny,
    RegisterSmall,
    RegisterNormal,
    Download,
    DownloadFromBackToSource,
    DownloadSucceeded,
    DownloadFailed,
    MarkZombie,
    Leave,
}

const PEER_RULES: &[Rule<PeerState, PeerEvent>] = &[
    Rule {
        event: PeerEvent::RegisterTiny,
        from: &[PeerState::Pending],
        to: PeerState::ReceivedTiny,
    },
    Rule {
        event: PeerEvent::RegisterSmall,
        from: &[PeerState::Pending],
        to: PeerState::ReceivedSmall,
    },
    Rule {
        event: PeerEvent::RegisterNormal,
        from: &[PeerState::Pending],
        to: PeerState::ReceivedNormal,
    },
    Rule {
        event: PeerEvent::Download,
        from: &[
            PeerState::ReceivedTiny,
            PeerState::ReceivedSmall,
            PeerState::ReceivedNormal,
        ],
        to: PeerState::Running,
    },
    Rule {
        event: PeerEvent::DownloadFromBackToSource,
        from: &[
            PeerState::ReceivedTiny,
            PeerState::ReceivedSmall,
            PeerState::ReceivedNormal,
            PeerState::Running,
        ],
        to: PeerState::BackToSource,
    },
    // 上报结果和分片流没有先后保证，注册完成后结果可能先到
    Rule {
        event: PeerEvent::DownloadSucceeded,
        from: &[
            PeerState::ReceivedTiny,
            PeerState::ReceivedSmall,
            PeerState::ReceivedNormal,
            PeerState::Running,
            PeerState::BackToSource,
        ],
        to: PeerState::Succeeded,
    },
    Rule {
        event: PeerEvent::DownloadFailed,
        from: &[
            PeerState::Pending,
            PeerState::ReceivedTiny,
            PeerState::ReceivedSmall,
            PeerState::ReceivedNormal,
            PeerState::Running,
            PeerState::BackToSource,
        ],
        to: PeerState::Failed,
    },
    Rule {
        event: PeerEvent::MarkZombie,
        from: &[
            PeerState::Pending,
            PeerState::ReceivedTiny,
            PeerState::ReceivedSmall,
            PeerState::ReceivedNormal,
            PeerState::Running,
            PeerState::BackToSource,
        ],
        to: PeerState::Zombie,
    },
    Rule {
        event: PeerEvent::Leave,
        from: &[
            PeerState::Pending,
            PeerState::ReceivedTiny,
            PeerState::ReceivedSmall,
            PeerState::ReceivedNormal,
            PeerState::Running,
            PeerState::BackToSource,
            PeerState::Succeeded,
            PeerState::Failed,
            PeerState::Zombie,
        ],
        to: PeerState::Leave,
    },
];

pub struct Peer {
    id: String,

    /// 反向索引，实体归 Task / Host 所有
    task_id: String,
    host_id: String,

    /// 分片完成位图
    pieces: Mutex<Bitfield>,

    /// 已完成分片数
    finished_count: AtomicI32,

    /// 最近 N 次分片耗时（毫秒）
    piece_costs: Mutex<FixedQueue<u64>>,

    fsm: Mutex<StateMachine<PeerState, PeerEvent>>,

    /// 注册时任务没有种子可用，调度时直接回源
    need_back_to_source: AtomicBool,

    /// 已经被要求回源过
    is_back_to_source: AtomicBool,

    /// 不允许与这些 peer 配对
    block_peers: DashSet<String>,

    /// 上报流的发送端，注册一次，Leave 时清掉
    stream: Mutex<Option<PeerPacketSender>>,

    created_at: u64,

    last_access: Arc<AtomicU64>,
}

impl Peer {
    pub fn new(id: &str, task_id: &str, host_id: &str) -> Self {
        let last_access = Arc::new(AtomicU64::new(datetime::now_millis()));

        // 每次迁移生效都刷新 last_access
        let mut fsm = StateMachine::new(PeerState::Pending, PEER_RULES);
        {
            let last_access = last_access.clone();
            let peer_id = id.to_string();
            fsm.observe(move |transition| {
                last_access.store(datetime::now_millis(), Ordering::Release);
                debug!(
                    "peer {peer_id} 状态迁移: {:?} -> {:?} ({:?})",
                    transition.from, transition.to, transition.event
                );
            });
        }

        Self {
            id: id.to_string(),
            task_id: task_id.to_string(),
            host_id: host_id.to_string(),
            pieces: Mutex::new(Bitfield::new()),
            finished_count: AtomicI32::new(0),
            piece_costs: Mutex::new(FixedQueue::new(PIECE_COST_RING_LIMIT)),
            fsm: Mutex::new(fsm),
            need_back_to_source: AtomicBool::new(false),
            is_back_to_source: AtomicBool::new(false),
            block_peers: DashSet::new(),
            stream: Mutex::new(None),
            created_at: datetime::now_millis(),
            last_access,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn state(&self) -> PeerState {
        self.fsm.lock_pe().current()
    }

    pub fn is(&self, state: PeerState) -> bool {
        self.state() == state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// 状态迁移。只做机器本身的事，实体间的副作用在 Registries 里处理
    pub fn transit(
        &self,
        event: PeerEvent,
    ) -> Result<Transition<PeerState, PeerEvent>, FsmError<PeerState, PeerEvent>> {
        self.fsm.lock_pe().handle(event)
    }

    /// 当前状态下事件是否可触发
    pub fn can(&self, event: PeerEvent) -> bool {
        self.fsm.lock_pe().can(event)
    }

    /// 记录一次分片完成
    pub fn update_progress(&self, piece_num: u32, finished_count: i32, cost_millis: u64) {
        self.pieces.lock_pe().set(piece_num as usize);
        self.finished_count.store(finished_count, Ordering::Release);
        self.piece_costs.lock_pe().push(cost_millis);
        self.touch();
    }

    /// 做种侧登记一个分片，不记耗时
    pub fn add_piece(&self, piece_num: u32) {
        self.pieces.lock_pe().set(piece_num as usize);
        self.finished_count.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    pub fn finished_count(&self) -> i32 {
        self.finished_count.load(Ordering::Acquire)
    }

    pub fn has_piece(&self, piece_num: u32) -> bool {
        self.pieces.lock_pe().get(piece_num as usize)
    }

    /// (最近一次耗时, 环内平均耗时, 样本数)
    pub fn cost_stats(&self) -> (u64, u64, usize) {
        let costs = self.piece_costs.lock_pe();
        (costs.back().copied().unwrap_or(0), costs.avg(), costs.len())
    }

    pub fn need_back_to_source(&self) -> bool {
        self.need_back_to_source.load(Ordering::Acquire)
    }

    pub fn set_need_back_to_source(&self) {
        self.need_back_to_source.store(true, Ordering::Release);
    }

    pub fn is_back_to_source(&self) -> bool {
        self.is_back_to_source.load(Ordering::Acquire)
    }

    pub fn set_back_to_source(&self) {
        self.is_back_to_source.store(true, Ordering::Release);
    }

    pub fn block_peers(&self) -> &DashSet<String> {
        &self.block_peers
    }

    pub fn block_peer(&self, peer_id: &str) {
        self.block_peers.insert(peer_id.to_string());
    }

    /// 绑定上报流。重复绑定以新的为准
    pub fn register_stream(&self, sender: PeerPacketSender) {
        let mut stream = self.stream.lock_pe();
        if stream.is_some() {
            warn!("peer {} 重复绑定上报流，覆盖旧的", self.id);
        }
        *stream = Some(sender);
    }

    pub fn load_stream(&self) -> Option<PeerPacketSender> {
        self.stream.lock_pe().clone()
    }

    pub fn has_stream(&self) -> bool {
        self.stream.lock_pe().is_some()
    }

    pub fn close_stream(&self) {
        *self.stream.lock_pe() = None;
    }

    /// 把调度包推给 peer
    pub async fn send_packet(&self, packet: PeerPacket) -> Result<()> {
        let sender = self
            .load_stream()
            .ok_or_else(|| anyhow!("peer {} 没有绑定上报流", self.id))?;
        sender
            .send(packet)
            .await
            .map_err(|_| anyhow!("peer {} 的上报流已关闭", self.id))
    }

    pub fn touch(&self) {
        self.last_access.store(datetime::now_millis(), Ordering::Release);
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }
}

pub struct PeerRegistry {
    peers: DashMap<String, Arc<Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    /// 放入 peer。已存在时返回已有实例（注册重试幂等）
    pub fn get_or_insert(&self, peer: Peer) -> (Arc<Peer>, bool) {
        match self.peers.entry(peer.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => (entry.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let peer = Arc::new(peer);
                entry.insert(peer.clone());
                (peer, true)
            }
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<Peer>> {
        self.peers.get(peer_id).map(|p| p.clone())
    }

    /// 只从 arena 里摘掉，级联清理走 Registries::delete_peer
    pub(crate) fn remove(&self, peer_id: &str) -> Option<Arc<Peer>> {
        self.peers.remove(peer_id).map(|(_, peer)| peer)
    }

    pub fn list(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|p| p.clone()).collect()
    }

    pub fn list_by_task(&self, task_id: &str) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .filter(|p| p.task_id == task_id)
            .map(|p| p.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
