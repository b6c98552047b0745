//! 事件定义。处理函数从不把错误抛给上层：记日志、改状态、继续，
//! 事件循环不能因为一个坏事件停摆。peer / task 已经没了的情况一律按空操作处理。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::event::{Event, EventContext};
use crate::protocol::{Code, PeerPacket, PeerResult, PieceResult};
use crate::resource::peer::{PeerEvent, PeerState};
use crate::resource::task::{Task, TaskEvent, TaskState};

/// peer 打开了分片上报流，给它安排父节点
pub struct StartReportPieceResult {
    pub task_id: String,
    pub peer_id: String,
}

#[async_trait]
impl Event for StartReportPieceResult {
    fn hash_key(&self) -> &str {
        &self.task_id
    }

    async fn apply(&self, ctx: &EventContext) {
        let Some(peer) = ctx.registries.peers().get(&self.peer_id) else {
            return;
        };

        // 已经有父节点的话重推一次调度包就够了
        if let Some(parent) = ctx.registries.parent_of(&peer) {
            debug!("peer {} 已有父节点 {}，不再调度", peer.id(), parent.id());
            let packet = ctx.scheduler.success_packet(&peer, &parent, &[]);
            if let Err(e) = peer.send_packet(packet).await {
                warn!("重推调度包失败: {e}");
            }
            return;
        }

        // 回源中的 peer 不需要父节点
        if peer.is(PeerState::BackToSource) {
            return;
        }

        // 注册时任务没有种子可用，直接回源
        if peer.need_back_to_source() {
            let Some(task) = ctx.registries.tasks().get(&self.task_id) else {
                return;
            };
            if task.can_back_to_source() {
                ctx.scheduler.notify_back_to_source(&task, &peer).await;
                return;
            }
        }

        ctx.scheduler
            .schedule_parent(&ctx.cancel_token, &peer, HashSet::new())
            .await;
    }
}

/// peer 上报一个分片下载成功
pub struct PieceDownloadSucceeded {
    pub task_id: String,
    pub piece: PieceResult,
}

#[async_trait]
impl Event for PieceDownloadSucceeded {
    fn hash_key(&self) -> &str {
        &self.task_id
    }

    async fn apply(&self, ctx: &EventContext) {
        let Some(peer) = ctx.registries.peers().get(&self.piece.src_pid) else {
            return;
        };
        // 收尾之后才到的迟到上报，不再动图
        if peer.is_terminal() {
            return;
        }
        if let Some(info) = &self.piece.piece_info {
            let cost = self.piece.end_time.saturating_sub(self.piece.begin_time);
            peer.update_progress(info.piece_num, self.piece.finished_count, cost);
        } else {
            peer.touch();
        }

        let Some(task) = ctx.registries.tasks().get(&self.task_id) else {
            return;
        };

        // 回源 peer 的分片顺手补进任务的分片索引
        if task.is_back_to_source_peer(peer.id()) {
            if let Some(info) = &self.piece.piece_info {
                task.add_piece(info.clone());
            }
            if task.is(TaskState::Pending) {
                let _ = task.transit(TaskEvent::Download);
            }
            return;
        }

        match ctx.registries.peers().get(&self.piece.dst_pid) {
            Some(source) => {
                source.touch();
                // 实际在用的来源和图上的父节点不一致时，以实际为准换父
                let current = ctx
                    .registries
                    .parent_of(&peer)
                    .map(|p| p.id().to_string());
                if self.piece.dst_pid != peer.id()
                    && current.as_deref() != Some(self.piece.dst_pid.as_str())
                {
                    debug!(
                        "peer {} 实际来源 {} 与父节点不一致，换父",
                        peer.id(),
                        self.piece.dst_pid
                    );
                    if let Err(e) = ctx.registries.replace_parent(&peer, &source) {
                        debug!("按实际来源换父失败: {e}");
                    }
                }
            }
            None => {
                // 来源 peer 没注册，跳过换父判断；
                // 只有当前父节点确实已经离开时才需要重新调度
                if let Some(parent) = ctx.registries.parent_of(&peer) {
                    if parent.is(PeerState::Leave) {
                        ctx.registries.delete_parent(&peer);
                        ctx.scheduler
                            .schedule_parent(
                                &ctx.cancel_token,
                                &peer,
                                HashSet::from([parent.id().to_string()]),
                            )
                            .await;
                    }
                }
            }
        }
    }
}

/// peer 上报一个分片下载失败
pub struct PieceDownloadFailed {
    pub task_id: String,
    pub piece: PieceResult,
}

#[async_trait]
impl Event for PieceDownloadFailed {
    fn hash_key(&self) -> &str {
        &self.task_id
    }

    async fn apply(&self, ctx: &EventContext) {
        let Some(peer) = ctx.registries.peers().get(&self.piece.src_pid) else {
            return;
        };
        if peer.is_terminal() {
            return;
        }
        peer.touch();

        let Some(task) = ctx.registries.tasks().get(&self.task_id) else {
            return;
        };
        if task.is_back_to_source_peer(peer.id()) {
            return;
        }

        match self.piece.code {
            Code::ClientWaitPieceReady => return,
            Code::PeerTaskNotFound => {
                // 来源那边已经没有这个任务，来源下线
                ctx.registries.delete_peer(&self.piece.dst_pid);
            }
            Code::SeedTaskNotFound | Code::SeedError | Code::SeedTaskDownloadFail => {
                // 种子节点出问题，下线并重新做种
                ctx.registries.delete_peer(&self.piece.dst_pid);
                ctx.seed_driver.spawn_seed(task.clone(), ctx.sender.clone());
            }
            _ => {
                debug!(
                    "peer {} 分片下载失败上报: {:?}",
                    peer.id(),
                    self.piece.code
                );
            }
        }

        // 拉黑肇事来源，换个父节点
        peer.block_peer(&self.piece.dst_pid);
        ctx.scheduler
            .schedule_parent(
                &ctx.cancel_token,
                &peer,
                HashSet::from([self.piece.dst_pid.clone()]),
            )
            .await;
    }
}

/// 做种失败
pub struct SeedTaskFailed {
    pub task_id: String,
}

#[async_trait]
impl Event for SeedTaskFailed {
    fn hash_key(&self) -> &str {
        &self.task_id
    }

    async fn apply(&self, ctx: &EventContext) {
        let Some(task) = ctx.registries.tasks().get(&self.task_id) else {
            return;
        };
        handle_seed_task_fail(ctx, &task).await;
    }
}

/// 做种失败的统一处理：允许回源就把全任务的 peer 都转回源，
/// 否则全部判失败。同分片内直接调用，不再入队（见 EventSender::enqueue）
pub(crate) async fn handle_seed_task_fail(ctx: &EventContext, task: &Arc<Task>) {
    warn!("task {} 做种失败", task.id());
    if task.is(TaskState::Running) {
        let _ = task.transit(TaskEvent::DownloadFailed);
    }

    if ctx.config.client_back_source_enabled() {
        for peer in ctx.registries.peers().list_by_task(task.id()) {
            if peer.is_terminal() || peer.is(PeerState::BackToSource) {
                continue;
            }
            if !task.can_back_to_source() {
                warn!("task {} 回源名额用尽，剩余 peer 等待调度", task.id());
                break;
            }
            ctx.scheduler.notify_back_to_source(task, &peer).await;
        }
        // 有 peer 在回源的话任务重新拉起
        if task.is(TaskState::Failed) && task.back_to_source_peer_count() > 0 {
            let _ = task.transit(TaskEvent::Download);
        }
    } else {
        for peer in ctx.registries.peers().list_by_task(task.id()) {
            if peer.is_terminal() {
                continue;
            }
            if let Err(e) = peer
                .send_packet(PeerPacket::with_code(
                    task.id(),
                    peer.id(),
                    Code::SchedTaskStatusError,
                ))
                .await
            {
                debug!("通知 peer {} 任务失败出错: {e}", peer.id());
            }
            let _ = ctx.registries.peer_transit(&peer, PeerEvent::DownloadFailed);
        }
    }
}

/// peer 上报整体下载成功
pub struct PeerDownloadSucceeded {
    pub task_id: String,
    pub peer_id: String,
    pub result: PeerResult,
}

#[async_trait]
impl Event for PeerDownloadSucceeded {
    fn hash_key(&self) -> &str {
        &self.task_id
    }

    async fn apply(&self, ctx: &EventContext) {
        let Some(peer) = ctx.registries.peers().get(&self.peer_id) else {
            return;
        };
        let was_back_to_source = peer.is(PeerState::BackToSource);
        if ctx
            .registries
            .peer_transit(&peer, PeerEvent::DownloadSucceeded)
            .is_err()
        {
            return;
        }
        info!("peer {} 下载成功", peer.id());

        let Some(task) = ctx.registries.tasks().get(&self.task_id) else {
            return;
        };

        // 回源 peer 第一个跑完，它上报的元信息就是任务的元信息
        if was_back_to_source && !task.is(TaskState::Succeeded) {
            task.update_content(self.result.total_piece_count, self.result.content_length);
            if task.is(TaskState::Pending) {
                let _ = task.transit(TaskEvent::Download);
            }
            if task.is(TaskState::Running) {
                let _ = task.transit(TaskEvent::DownloadSucceeded);
            }
        }

        // 子节点围着新的完整源重新收包
        for child in ctx.registries.children_of(&peer) {
            let packet = ctx.scheduler.success_packet(&child, &peer, &[]);
            if let Err(e) = child.send_packet(packet).await {
                debug!("给子节点 {} 推包失败: {e}", child.id());
            }
        }
    }
}

/// peer 上报整体下载失败
pub struct PeerDownloadFailed {
    pub task_id: String,
    pub peer_id: String,
    pub result: PeerResult,
}

#[async_trait]
impl Event for PeerDownloadFailed {
    fn hash_key(&self) -> &str {
        &self.task_id
    }

    async fn apply(&self, ctx: &EventContext) {
        let Some(peer) = ctx.registries.peers().get(&self.peer_id) else {
            return;
        };
        let was_back_to_source = peer.is(PeerState::BackToSource);
        let children = ctx.registries.children_of(&peer);
        if ctx
            .registries
            .peer_transit(&peer, PeerEvent::DownloadFailed)
            .is_err()
        {
            return;
        }
        info!("peer {} 下载失败", peer.id());

        // 子节点换父，肇事者进黑名单
        for child in children {
            let _ = ctx
                .scheduler
                .notify_and_find_parent(&child, &HashSet::from([peer.id().to_string()]))
                .await;
        }

        // 回源 peer 失败且任务还没成功过，等价于做种失败
        if was_back_to_source {
            let Some(task) = ctx.registries.tasks().get(&self.task_id) else {
                return;
            };
            if !task.is(TaskState::Succeeded) {
                if task.is(TaskState::Running) {
                    let _ = task.transit(TaskEvent::DownloadFailed);
                }
                handle_seed_task_fail(ctx, &task).await;
            }
        }
    }
}

/// peer 宣告离开
pub struct PeerLeave {
    pub task_id: String,
    pub peer_id: String,
}

#[async_trait]
impl Event for PeerLeave {
    fn hash_key(&self) -> &str {
        &self.task_id
    }

    async fn apply(&self, ctx: &EventContext) {
        let Some(peer) = ctx.registries.peers().get(&self.peer_id) else {
            return;
        };
        let _ = ctx.registries.peer_transit(&peer, PeerEvent::Leave);

        // 子节点换父之后再摘掉自己
        for child in ctx.registries.children_of(&peer) {
            let _ = ctx
                .scheduler
                .notify_and_find_parent(&child, &HashSet::from([peer.id().to_string()]))
                .await;
        }
        ctx.registries.delete_peer(&self.peer_id);
        info!("peer {} 已离开", self.peer_id);
    }
}

// ===========================================================================
// GC 触发的管理类事件
// ===========================================================================

/// 空闲超时的 peer 标记为僵尸。按 peer id 分片，不动图
pub struct MarkPeerZombie {
    pub peer_id: String,
}

#[async_trait]
impl Event for MarkPeerZombie {
    fn hash_key(&self) -> &str {
        &self.peer_id
    }

    async fn apply(&self, ctx: &EventContext) {
        let Some(peer) = ctx.registries.peers().get(&self.peer_id) else {
            return;
        };
        if ctx
            .registries
            .peer_transit(&peer, PeerEvent::MarkZombie)
            .is_ok()
        {
            debug!("peer {} 被标记为僵尸", self.peer_id);
        }
    }
}

/// 空置超时的任务下线，级联清掉残留的（种子）peer
pub struct TaskLeave {
    pub task_id: String,
}

#[async_trait]
impl Event for TaskLeave {
    fn hash_key(&self) -> &str {
        &self.task_id
    }

    async fn apply(&self, ctx: &EventContext) {
        let Some(task) = ctx.registries.tasks().get(&self.task_id) else {
            return;
        };
        let _ = task.transit(TaskEvent::Leave);
        let remaining: Vec<String> = task.peers().iter().map(|p| p.clone()).collect();
        for peer_id in remaining {
            ctx.registries.delete_peer(&peer_id);
        }
        ctx.registries.tasks().delete(&self.task_id);
        info!("task {} 已回收", self.task_id);
    }
}

/// 空置超时的主机下线。按 host id 分片
pub struct HostLeave {
    pub host_id: String,
}

#[async_trait]
impl Event for HostLeave {
    fn hash_key(&self) -> &str {
        &self.host_id
    }

    async fn apply(&self, ctx: &EventContext) {
        let Some(host) = ctx.registries.hosts().get(&self.host_id) else {
            return;
        };
        // 入队之后可能又有 peer 挂上来了，处理时再确认一次
        if host.peer_count() == 0 && !host.is_seed() {
            ctx.registries.hosts().delete(&self.host_id);
            info!("host {} 已回收", self.host_id);
        }
    }
}
