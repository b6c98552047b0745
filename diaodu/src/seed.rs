//! 种子驱动。任务第一次出现时由种子节点先从源站拉一遍内容，
//! 驱动消费种子的分片流：每个分片进任务索引，种子本身以一个
//! 合成 peer 的身份挂到任务的图上，当所有人的根。
//! 种子协议本身是外部协作方，这里只约定 SeedClient 能力。

use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::{Config, TINY_FILE_SIZE};
use crate::event::EventSender;
use crate::event::events::SeedTaskFailed;
use crate::protocol::{PieceInfo, UrlMeta};
use crate::resource::Registries;
use crate::resource::host::Endpoint;
use crate::resource::peer::{Peer, PeerEvent};
use crate::resource::task::{Task, TaskEvent, TaskState};

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("seed register failed: {0}")]
    RegisterFailed(String),

    #[error("seed download failed: {0}")]
    DownloadFailed(String),

    #[error("seed invoke failed: {0}")]
    InvokeFailed(String),

    #[error("init seed peer failed: host {0} not found")]
    InitPeerFailed(String),

    #[error("seed unknown error: {0}")]
    Unknown(String),
}

/// 种子分片流里的一条消息
#[derive(Debug, Clone)]
pub struct SeedPiece {
    /// 种子侧声明的 peer id 和所在主机
    pub peer_id: String,
    pub host_id: String,

    pub piece_info: Option<PieceInfo>,

    /// 是否是收尾消息。收尾消息携带任务的最终元信息
    pub done: bool,
    pub total_piece_count: i32,
    pub content_length: i64,
}

/// 与种子节点交互的能力，由传输层提供实现
#[async_trait]
pub trait SeedClient: Send + Sync {
    /// 发起做种，返回分片流
    async fn obtain_seed(
        &self,
        task_id: &str,
        url: &str,
        url_meta: &UrlMeta,
    ) -> Result<mpsc::Receiver<Result<SeedPiece, SeedError>>, SeedError>;

    /// 从种子主机直接拉 tiny 文件内容
    async fn download_tiny(&self, endpoint: &Endpoint, task_id: &str) -> Result<Bytes>;
}

/// 没配种子集群时的占位实现
pub struct NoopSeedClient;

#[async_trait]
impl SeedClient for NoopSeedClient {
    async fn obtain_seed(
        &self,
        _task_id: &str,
        _url: &str,
        _url_meta: &UrlMeta,
    ) -> Result<mpsc::Receiver<Result<SeedPiece, SeedError>>, SeedError> {
        Err(SeedError::RegisterFailed("seed client not configured".to_string()))
    }

    async fn download_tiny(&self, _endpoint: &Endpoint, _task_id: &str) -> Result<Bytes> {
        Err(anyhow!("seed client not configured"))
    }
}

pub struct SeedPeerDriver {
    registries: Arc<Registries>,

    client: Arc<dyn SeedClient>,

    config: Config,
}

impl SeedPeerDriver {
    pub fn new(registries: Arc<Registries>, client: Arc<dyn SeedClient>, config: Config) -> Self {
        Self {
            registries,
            client,
            config,
        }
    }

    /// 后台做种。失败时置任务失败并广播做种失败事件
    pub fn spawn_seed(self: &Arc<Self>, task: Arc<Task>, sender: EventSender) {
        let driver = self.clone();
        tokio::spawn(async move {
            if let Err(e) = driver.start_seed(task.clone()).await {
                error!("task {} 做种失败: {e}", task.id());
                sender
                    .enqueue(Box::new(SeedTaskFailed {
                        task_id: task.id().to_string(),
                    }))
                    .await;
            }
        });
    }

    /// 发起做种并消费分片流，直到收尾或者出错
    pub async fn start_seed(&self, task: Arc<Task>) -> Result<(), SeedError> {
        info!("task {} 开始做种", task.id());
        let mut stream = self
            .client
            .obtain_seed(task.id(), task.url(), task.url_meta())
            .await?;

        let mut seed_peer: Option<Arc<Peer>> = None;
        while let Some(message) = stream.recv().await {
            let piece = message?;

            // 第一个分片到达时把种子挂成图上的根
            let seed = match &seed_peer {
                Some(seed) => seed.clone(),
                None => {
                    let seed = self.init_seed_peer(&task, &piece)?;
                    seed_peer = Some(seed.clone());
                    seed
                }
            };
            seed.touch();

            if piece.done {
                self.finish_seed(&task, &seed, &piece).await;
                return Ok(());
            }

            if let Some(info) = piece.piece_info {
                seed.add_piece(info.piece_num);
                task.add_piece(info);
            }
        }

        // 流没给收尾消息就断了
        if task.is(TaskState::Succeeded) {
            Ok(())
        } else {
            Err(SeedError::DownloadFailed(format!(
                "piece stream ended but task state is {:?}",
                task.state()
            )))
        }
    }

    /// 收尾：落元信息、迁移状态、顺手缓存 tiny 内容
    async fn finish_seed(&self, task: &Arc<Task>, seed: &Arc<Peer>, piece: &SeedPiece) {
        task.update_content(piece.total_piece_count, piece.content_length);
        if task.is(TaskState::Running) {
            if let Err(e) = task.transit(TaskEvent::DownloadSucceeded) {
                warn!("task {} 置成功失败: {e}", task.id());
            }
        }
        let _ = self.registries.peer_transit(seed, PeerEvent::DownloadSucceeded);

        if (0..=TINY_FILE_SIZE).contains(&piece.content_length) && task.direct_piece().is_none() {
            if let Some(host) = self.registries.hosts().get(seed.host_id()) {
                match self.client.download_tiny(&host.endpoint(), task.id()).await {
                    Ok(content) if content.len() as i64 == piece.content_length => {
                        task.set_direct_piece(content);
                    }
                    Ok(content) => {
                        warn!(
                            "task {} tiny 内容长度不符: {} != {}",
                            task.id(),
                            content.len(),
                            piece.content_length
                        );
                    }
                    Err(e) => warn!("task {} tiny 内容预取失败: {e}", task.id()),
                }
            }
        }
        info!("task {} 做种完成，共 {} 个分片", task.id(), piece.total_piece_count);
    }

    fn init_seed_peer(&self, task: &Arc<Task>, piece: &SeedPiece) -> Result<Arc<Peer>, SeedError> {
        let host = self
            .registries
            .hosts()
            .get(&piece.host_id)
            .ok_or_else(|| SeedError::InitPeerFailed(piece.host_id.clone()))?;

        let (seed, created) = self
            .registries
            .peers()
            .get_or_insert(Peer::new(&piece.peer_id, task.id(), host.id()));
        if created {
            task.add_peer(seed.id());
            let _ = self.registries.hosts().add_peer(host.id(), seed.id());
            // 种子 peer 不走注册协议，直接进入 Running
            let _ = seed.transit(PeerEvent::RegisterNormal);
            let _ = seed.transit(PeerEvent::Download);
        }
        // 最近一次做种的种子，回源判定用
        task.set_seed_peer_id(seed.id());

        if !task.is(TaskState::Running) {
            if let Err(e) = task.transit(TaskEvent::Download) {
                warn!("task {} 进入下载态失败: {e}", task.id());
            }
        }
        Ok(seed)
    }

    /// tiny 文件内容：优先拿缓存，否则限时找种子现拉
    pub async fn download_tiny(&self, task: &Arc<Task>) -> Result<Bytes> {
        if let Some(content) = task.direct_piece() {
            return Ok(content);
        }

        let seed_id = task
            .seed_peer_id()
            .ok_or_else(|| anyhow!("task {} 没有种子 peer", task.id()))?;
        let seed = self
            .registries
            .peers()
            .get(&seed_id)
            .ok_or_else(|| anyhow!("种子 peer {seed_id} 不存在"))?;
        let host = self
            .registries
            .hosts()
            .get(seed.host_id())
            .ok_or_else(|| anyhow!("种子主机 {} 不存在", seed.host_id()))?;

        timeout(
            self.config.tiny_download_timeout(),
            self.client.download_tiny(&host.endpoint(), task.id()),
        )
        .await
        .map_err(|_| anyhow!("task {} tiny 内容拉取超时", task.id()))?
    }
}
