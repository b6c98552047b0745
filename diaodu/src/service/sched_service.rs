//! 调度服务门面。把传输层的四个操作翻译成注册表操作和事件，
//! 错误映射成传输层可见的分类。

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, PIECE_SIZE, TINY_FILE_SIZE};
use crate::event::events::{
    PeerDownloadFailed, PeerDownloadSucceeded, PeerLeave, PieceDownloadFailed,
    PieceDownloadSucceeded, StartReportPieceResult,
};
use crate::event::{Event, EventSender};
use crate::idgen;
use crate::protocol::{
    PeerPacketSender, PeerResult, PeerTarget, PieceResultReceiver, RegisterRequest,
    RegisterResult, SinglePiece, SizeScope,
};
use crate::resource::Registries;
use crate::resource::peer::{Peer, PeerEvent, PeerState};
use crate::resource::task::Task;
use crate::scheduler::Scheduler;
use crate::seed::{SeedError, SeedPeerDriver};

/// 传输层可见的错误分类
#[derive(Debug, Error)]
pub enum SchedError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("no available parent")]
    Unavailable,

    #[error(transparent)]
    SeedFailed(#[from] SeedError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct SchedService {
    registries: Arc<Registries>,

    #[allow(dead_code)]
    scheduler: Arc<Scheduler>,

    seed_driver: Arc<SeedPeerDriver>,

    sender: EventSender,

    config: Config,

    cancel_token: CancellationToken,
}

impl SchedService {
    pub fn new(
        registries: Arc<Registries>,
        scheduler: Arc<Scheduler>,
        seed_driver: Arc<SeedPeerDriver>,
        sender: EventSender,
        config: Config,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            registries,
            scheduler,
            seed_driver,
            sender,
            config,
            cancel_token,
        }
    }

    /// 注册 peer。幂等：同一个 peer id 重复注册只会有一个实例，
    /// 并按它当前的状态返回结果
    pub async fn register_peer(
        &self,
        request: RegisterRequest,
    ) -> Result<RegisterResult, SchedError> {
        if request.url.is_empty() {
            return Err(SchedError::BadRequest("url 不能为空".to_string()));
        }
        if request.peer_id.is_empty() {
            return Err(SchedError::BadRequest("peer id 不能为空".to_string()));
        }
        if request.peer_host.id.is_empty() {
            return Err(SchedError::BadRequest("host id 不能为空".to_string()));
        }

        let task_id = idgen::task_id(&request.url, &request.url_meta);
        // 回源名额：客户端回源被关掉时就是 0
        let back_to_source_limit = if self.config.client_back_source_enabled() {
            self.config.back_to_source_count()
        } else {
            0
        };
        let (task, task_created) = self.registries.tasks().get_or_insert(
            &task_id,
            &request.url,
            &request.url_meta,
            back_to_source_limit,
        );
        task.touch();
        let host = self.registries.hosts().upsert(&request.peer_host);

        // 新任务先安排做种
        if task_created && self.config.seed_enabled() {
            info!("task {task_id} 首次注册，触发做种");
            self.seed_driver.spawn_seed(task.clone(), self.sender.clone());
        }

        let (peer, peer_created) = self
            .registries
            .peers()
            .get_or_insert(Peer::new(&request.peer_id, &task_id, host.id()));
        if !peer_created {
            debug!("peer {} 重复注册，按当前状态返回", peer.id());
            return Ok(self.result_for_existing(&task, &peer));
        }

        task.add_peer(peer.id());
        let _ = self.registries.hosts().add_peer(host.id(), peer.id());
        // 任务是新建的又没法做种，第一个 peer 只能直接回源
        if task_created && !self.config.seed_enabled() && self.config.client_back_source_enabled()
        {
            peer.set_need_back_to_source();
        }

        // 按内容大小分档。元信息还没出来（做种没完成）时只能按 normal 走
        let content_length = task.content_length();
        if (0..=TINY_FILE_SIZE).contains(&content_length) {
            match self.seed_driver.download_tiny(&task).await {
                Ok(content) if content.len() as i64 == content_length => {
                    let _ = self.registries.peer_transit(&peer, PeerEvent::RegisterTiny);
                    return Ok(RegisterResult {
                        task_id,
                        size_scope: SizeScope::Tiny,
                        direct_piece: Some(content),
                        single_piece: None,
                    });
                }
                Ok(content) => warn!(
                    "task {task_id} tiny 内容长度不符（{} != {content_length}），退化为 normal",
                    content.len()
                ),
                Err(e) => warn!("task {task_id} tiny 内容获取失败，退化为 normal: {e}"),
            }
        } else if (0..=PIECE_SIZE).contains(&content_length) {
            if let Some(single_piece) = self.single_piece(&task) {
                let _ = self.registries.peer_transit(&peer, PeerEvent::RegisterSmall);
                return Ok(RegisterResult {
                    task_id,
                    size_scope: SizeScope::Small,
                    direct_piece: None,
                    single_piece: Some(single_piece),
                });
            }
            debug!("task {task_id} 种子还没产出首个分片，退化为 normal");
        }

        let _ = self.registries.peer_transit(&peer, PeerEvent::RegisterNormal);
        Ok(RegisterResult {
            task_id,
            size_scope: SizeScope::Normal,
            direct_piece: None,
            single_piece: None,
        })
    }

    /// 重复注册：不再触发 FSM 事件，照当前状态拼结果
    fn result_for_existing(&self, task: &Arc<Task>, peer: &Arc<Peer>) -> RegisterResult {
        let (size_scope, direct_piece, single_piece) = match peer.state() {
            PeerState::ReceivedTiny => (SizeScope::Tiny, task.direct_piece(), None),
            PeerState::ReceivedSmall => (SizeScope::Small, None, self.single_piece(task)),
            _ => (SizeScope::Normal, None, None),
        };
        RegisterResult {
            task_id: task.id().to_string(),
            size_scope,
            direct_piece,
            single_piece,
        }
    }

    /// small 档位的单分片引用：种子 peer 的地址 + 0 号分片
    fn single_piece(&self, task: &Arc<Task>) -> Option<SinglePiece> {
        let seed_id = task.seed_peer_id()?;
        let seed = self.registries.peers().get(&seed_id)?;
        if seed.is(PeerState::Failed) || seed.is(PeerState::Leave) {
            return None;
        }
        let piece_info = task.piece(0)?;
        let host = self.registries.hosts().get(seed.host_id())?;
        let endpoint = host.endpoint();
        Some(SinglePiece {
            dst_pid: seed_id,
            dst_addr: format!("{}:{}", endpoint.ip, endpoint.download_port),
            piece_info,
        })
    }

    /// 挂上分片上报流并一直消费到断流。
    /// 断流时 peer 如果还没有走到终态，按离开处理
    pub async fn report_piece_result(
        &self,
        peer_id: &str,
        mut results: PieceResultReceiver,
        packets: PeerPacketSender,
    ) -> Result<(), SchedError> {
        let peer = self
            .registries
            .peers()
            .get(peer_id)
            .ok_or_else(|| SchedError::NotFound(format!("peer {peer_id}")))?;

        peer.register_stream(packets);
        // Received* -> Running。回源中或已终态的 peer 保持原状
        if peer.can(PeerEvent::Download) {
            let _ = self.registries.peer_transit(&peer, PeerEvent::Download);
        }
        self.sender
            .enqueue(Box::new(StartReportPieceResult {
                task_id: peer.task_id().to_string(),
                peer_id: peer.id().to_string(),
            }))
            .await;

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                result = results.recv() => {
                    let Some(piece) = result else { break };
                    if piece.src_pid != peer.id() {
                        warn!("上报流里混入了别人的结果: {} != {}", piece.src_pid, peer.id());
                        continue;
                    }
                    let event: Box<dyn Event> = if piece.success {
                        Box::new(PieceDownloadSucceeded {
                            task_id: peer.task_id().to_string(),
                            piece,
                        })
                    } else {
                        Box::new(PieceDownloadFailed {
                            task_id: peer.task_id().to_string(),
                            piece,
                        })
                    };
                    self.sender.enqueue(event).await;
                }
            }
        }

        peer.close_stream();
        if !peer.is_terminal() {
            debug!("peer {} 的上报流断开，按离开处理", peer.id());
            self.sender
                .enqueue(Box::new(PeerLeave {
                    task_id: peer.task_id().to_string(),
                    peer_id: peer.id().to_string(),
                }))
                .await;
        }
        Ok(())
    }

    /// peer 上报整体结果
    pub async fn report_peer_result(&self, result: PeerResult) -> Result<(), SchedError> {
        let peer = self
            .registries
            .peers()
            .get(&result.peer_id)
            .ok_or_else(|| SchedError::NotFound(format!("peer {}", result.peer_id)))?;

        let event: Box<dyn Event> = if result.success {
            Box::new(PeerDownloadSucceeded {
                task_id: peer.task_id().to_string(),
                peer_id: peer.id().to_string(),
                result,
            })
        } else {
            Box::new(PeerDownloadFailed {
                task_id: peer.task_id().to_string(),
                peer_id: peer.id().to_string(),
                result,
            })
        };
        self.sender.enqueue(event).await;
        Ok(())
    }

    /// peer 主动离开任务
    pub async fn leave_task(&self, target: PeerTarget) -> Result<(), SchedError> {
        let peer = self
            .registries
            .peers()
            .get(&target.peer_id)
            .ok_or_else(|| SchedError::NotFound(format!("peer {}", target.peer_id)))?;

        self.sender
            .enqueue(Box::new(PeerLeave {
                task_id: peer.task_id().to_string(),
                peer_id: peer.id().to_string(),
            }))
            .await;
        Ok(())
    }

    pub fn registries(&self) -> &Arc<Registries> {
        &self.registries
    }
}
