//! 任务注册表。一个任务对应一份要分发的内容，携带分片索引、
//! peer 集合和 peer 关系图。

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use diaodu_util::datetime;
use diaodu_util::fsm::{FsmError, Rule, StateMachine, Transition};
use diaodu_util::sync::MutexExt;
use tracing::debug;

use crate::protocol::{PieceInfo, UrlMeta};
use crate::resource::dag::Dag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Download,
    DownloadSucceeded,
    DownloadFailed,
    Leave,
}

/// 任务成功后不会销毁，其他 peer 还能继续把它当作来源，
/// 所以 Succeeded / Failed 都允许重新进入 Running。
const TASK_RULES: &[Rule<TaskState, TaskEvent>] = &[
    Rule {
        event: TaskEvent::Download,
        from: &[TaskState::Pending, TaskState::Failed, TaskState::Succeeded],
        to: TaskState::Running,
    },
    Rule {
        event: TaskEvent::DownloadSucceeded,
        from: &[TaskState::Running],
        to: TaskState::Succeeded,
    },
    Rule {
        event: TaskEvent::DownloadFailed,
        from: &[TaskState::Running],
        to: TaskState::Failed,
    },
    Rule {
        event: TaskEvent::Leave,
        from: &[
            TaskState::Pending,
            TaskState::Running,
            TaskState::Succeeded,
            TaskState::Failed,
        ],
        to: TaskState::Leave,
    },
];

pub struct Task {
    id: String,

    url: String,

    url_meta: UrlMeta,

    /// 内容长度，做种之前未知，-1 占位
    content_length: AtomicI64,

    /// 分片总数，做种之前未知，-1 占位
    total_piece_count: AtomicI32,

    /// 只增不删的分片索引
    pieces: DashMap<u32, PieceInfo>,

    fsm: Mutex<StateMachine<TaskState, TaskEvent>>,

    /// 属于本任务的 peer id 集合，与 dag 的顶点集保持一致
    peers: DashSet<String>,

    dag: Mutex<Dag>,

    /// 正在回源的 peer
    back_to_source_peers: DashSet<String>,

    /// 允许同时回源的数量
    back_to_source_limit: u32,

    /// 连续的 peer 级失败次数
    peer_failed_count: AtomicU32,

    /// 最近一次做种的种子 peer。取"最近创建"的语义，重新做种时覆盖
    seed_peer_id: Mutex<Option<String>>,

    /// tiny 文件的完整内容
    direct_piece: Mutex<Option<Bytes>>,

    created_at: u64,

    last_access: Arc<AtomicU64>,
}

impl Task {
    pub fn new(id: String, url: String, url_meta: UrlMeta, back_to_source_limit: u32) -> Self {
        let last_access = Arc::new(AtomicU64::new(datetime::now_millis()));

        // 每次迁移生效都刷新 last_access
        let mut fsm = StateMachine::new(TaskState::Pending, TASK_RULES);
        {
            let last_access = last_access.clone();
            let task_id = id.clone();
            fsm.observe(move |transition| {
                last_access.store(datetime::now_millis(), Ordering::Release);
                debug!(
                    "task {task_id} 状态迁移: {:?} -> {:?} ({:?})",
                    transition.from, transition.to, transition.event
                );
            });
        }

        Self {
            id,
            url,
            url_meta,
            content_length: AtomicI64::new(-1),
            total_piece_count: AtomicI32::new(-1),
            pieces: DashMap::new(),
            fsm: Mutex::new(fsm),
            peers: DashSet::new(),
            dag: Mutex::new(Dag::new()),
            back_to_source_peers: DashSet::new(),
            back_to_source_limit,
            peer_failed_count: AtomicU32::new(0),
            seed_peer_id: Mutex::new(None),
            direct_piece: Mutex::new(None),
            created_at: datetime::now_millis(),
            last_access,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn url_meta(&self) -> &UrlMeta {
        &self.url_meta
    }

    pub fn state(&self) -> TaskState {
        self.fsm.lock_pe().current()
    }

    pub fn is(&self, state: TaskState) -> bool {
        self.state() == state
    }

    /// 任务状态迁移。迁移生效会触发观察者刷新 last_access
    pub fn transit(
        &self,
        event: TaskEvent,
    ) -> Result<Transition<TaskState, TaskEvent>, FsmError<TaskState, TaskEvent>> {
        self.fsm.lock_pe().handle(event)
    }

    pub fn content_length(&self) -> i64 {
        self.content_length.load(Ordering::Acquire)
    }

    pub fn total_piece_count(&self) -> i32 {
        self.total_piece_count.load(Ordering::Acquire)
    }

    /// 做种结束时记录内容大小与分片总数
    pub fn update_content(&self, total_piece_count: i32, content_length: i64) {
        self.total_piece_count.store(total_piece_count, Ordering::Release);
        self.content_length.store(content_length, Ordering::Release);
    }

    pub fn add_piece(&self, piece: PieceInfo) {
        self.pieces.entry(piece.piece_num).or_insert(piece);
    }

    pub fn piece(&self, piece_num: u32) -> Option<PieceInfo> {
        self.pieces.get(&piece_num).map(|p| p.clone())
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn peers(&self) -> &DashSet<String> {
        &self.peers
    }

    pub fn dag(&self) -> &Mutex<Dag> {
        &self.dag
    }

    /// peer 加入任务，同时成为图里的顶点
    pub fn add_peer(&self, peer_id: &str) {
        self.peers.insert(peer_id.to_string());
        self.dag.lock_pe().add_vertex(peer_id);
        self.touch();
    }

    /// peer 退出任务。返回 (被切断的父节点, 失去父节点的子节点)
    pub fn delete_peer(&self, peer_id: &str) -> (Option<String>, Vec<String>) {
        self.peers.remove(peer_id);
        self.back_to_source_peers.remove(peer_id);
        self.touch();
        self.dag.lock_pe().remove_vertex(peer_id)
    }

    pub fn can_back_to_source(&self) -> bool {
        (self.back_to_source_peers.len() as u32) < self.back_to_source_limit
    }

    pub fn add_back_to_source_peer(&self, peer_id: &str) {
        self.back_to_source_peers.insert(peer_id.to_string());
    }

    pub fn delete_back_to_source_peer(&self, peer_id: &str) {
        self.back_to_source_peers.remove(peer_id);
    }

    pub fn is_back_to_source_peer(&self, peer_id: &str) -> bool {
        self.back_to_source_peers.contains(peer_id)
    }

    pub fn back_to_source_peer_count(&self) -> usize {
        self.back_to_source_peers.len()
    }

    pub fn peer_failed_count(&self) -> u32 {
        self.peer_failed_count.load(Ordering::Acquire)
    }

    pub fn inc_peer_failed_count(&self) {
        self.peer_failed_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn reset_peer_failed_count(&self) {
        self.peer_failed_count.store(0, Ordering::Release);
    }

    pub fn seed_peer_id(&self) -> Option<String> {
        self.seed_peer_id.lock_pe().clone()
    }

    pub fn set_seed_peer_id(&self, peer_id: &str) {
        *self.seed_peer_id.lock_pe() = Some(peer_id.to_string());
    }

    pub fn direct_piece(&self) -> Option<Bytes> {
        self.direct_piece.lock_pe().clone()
    }

    pub fn set_direct_piece(&self, content: Bytes) {
        *self.direct_piece.lock_pe() = Some(content);
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

pub struct TaskRegistry {
    tasks: DashMap<String, Arc<Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    /// 取任务，不存在则创建。并发下同一个 id 只会有一个实例。
    /// 返回值的 bool 表示是否新建
    pub fn get_or_insert(
        &self,
        id: &str,
        url: &str,
        url_meta: &UrlMeta,
        back_to_source_limit: u32,
    ) -> (Arc<Task>, bool) {
        match self.tasks.entry(id.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let task = Arc::new(Task::new(
                    id.to_string(),
                    url.to_string(),
                    url_meta.clone(),
                    back_to_source_limit,
                ));
                entry.insert(task.clone());
                debug!("新任务创建: {id}");
                (task, true)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Task>> {
        self.tasks.get(id).map(|t| t.clone())
    }

    pub fn delete(&self, id: &str) -> Option<Arc<Task>> {
        self.tasks.remove(id).map(|(_, task)| task)
    }

    pub fn list(&self) -> Vec<Arc<Task>> {
        self.tasks.iter().map(|t| t.clone()).collect()
    }

    pub fn peers_of(&self, id: &str) -> Vec<String> {
        self.get(id)
            .map(|task| task.peers.iter().map(|p| p.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
