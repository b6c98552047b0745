//! 周期回收。peer / task / host 三类扫描各有自己的间隔，
//! 扫描只负责找出过期对象，实际的图变更都包装成事件走事件循环，
//! 避免和正常调度抢着改图。

use std::sync::Arc;
use std::time::Duration;

use diaodu_util::datetime;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::event::EventSender;
use crate::event::events::{HostLeave, MarkPeerZombie, PeerLeave, TaskLeave};
use crate::resource::Registries;

pub struct Gc {
    registries: Arc<Registries>,

    sender: EventSender,

    config: Config,

    cancel_token: CancellationToken,
}

impl Gc {
    pub fn new(
        registries: Arc<Registries>,
        sender: EventSender,
        config: Config,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            registries,
            sender,
            config,
            cancel_token,
        }
    }

    pub async fn run(self) {
        let mut peer_tick = interval(self.config.peer_gc_interval());
        let mut task_tick = interval(self.config.task_gc_interval());
        let mut host_tick = interval(self.config.host_gc_interval());
        // interval 的第一跳是立即触发的，跳过
        peer_tick.tick().await;
        task_tick.tick().await;
        host_tick.tick().await;

        info!("GC 已启动");
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                _ = peer_tick.tick() => self.sweep_peers().await,
                _ = task_tick.tick() => self.sweep_tasks().await,
                _ = host_tick.tick() => self.sweep_hosts().await,
            }
        }
        info!("GC 已退出");
    }

    /// 超过 TTI 的 peer 标僵尸（没连着流的顺手请离），超过 TTL 的无条件请离
    async fn sweep_peers(&self) {
        let now = datetime::now_millis();
        for peer in self.registries.peers().list() {
            // 种子 peer 不按空闲时间回收，跟着主机或任务走
            let is_seed = self
                .registries
                .hosts()
                .get(peer.host_id())
                .map(|host| host.is_seed())
                .unwrap_or(false);
            if is_seed {
                continue;
            }

            let idle = Duration::from_millis(now.saturating_sub(peer.last_access()));
            if idle > self.config.peer_ttl() {
                debug!("peer {} 空闲 {idle:?} 超过 ttl，强制移除", peer.id());
                self.sender
                    .enqueue(Box::new(PeerLeave {
                        task_id: peer.task_id().to_string(),
                        peer_id: peer.id().to_string(),
                    }))
                    .await;
            } else if idle > self.config.peer_tti() && !peer.is_terminal() {
                debug!("peer {} 空闲 {idle:?} 超过 tti，标记僵尸", peer.id());
                self.sender
                    .enqueue(Box::new(MarkPeerZombie {
                        peer_id: peer.id().to_string(),
                    }))
                    .await;
                if !peer.has_stream() {
                    self.sender
                        .enqueue(Box::new(PeerLeave {
                            task_id: peer.task_id().to_string(),
                            peer_id: peer.id().to_string(),
                        }))
                        .await;
                }
            }
        }
    }

    /// 只剩种子 peer（或一个 peer 都没有）且空置超时的任务回收
    async fn sweep_tasks(&self) {
        let now = datetime::now_millis();
        for task in self.registries.tasks().list() {
            let client_peers = task
                .peers()
                .iter()
                .filter_map(|id| self.registries.peers().get(&id))
                .filter(|peer| {
                    self.registries
                        .hosts()
                        .get(peer.host_id())
                        .map(|host| !host.is_seed())
                        .unwrap_or(true)
                })
                .count();
            if client_peers > 0 {
                continue;
            }

            let idle = Duration::from_millis(now.saturating_sub(task.last_access()));
            if idle > self.config.task_ttl() {
                debug!("task {} 空置 {idle:?} 超过 ttl，回收", task.id());
                self.sender
                    .enqueue(Box::new(TaskLeave {
                        task_id: task.id().to_string(),
                    }))
                    .await;
            }
        }
    }

    /// 没有 peer 且空置超时的非种子主机回收
    async fn sweep_hosts(&self) {
        let now = datetime::now_millis();
        for host in self.registries.hosts().list() {
            if host.is_seed() || host.peer_count() > 0 {
                continue;
            }
            let idle = Duration::from_millis(now.saturating_sub(host.last_access()));
            if idle > self.config.host_ttl() {
                debug!("host {} 空置 {idle:?} 超过 ttl，回收", host.id());
                self.sender
                    .enqueue(Box::new(HostLeave {
                        host_id: host.id().to_string(),
                    }))
                    .await;
            }
        }
    }
}
