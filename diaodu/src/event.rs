//! 事件循环。所有图变更都包装成事件，按 hash(key) mod N 路由到
//! 固定的 worker 队列，单个 worker FIFO 消费自己的队列。
//! 于是同一个任务的事件严格串行，不同任务之间完全并行。

pub mod events;

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ahash::AHasher;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{CHANNEL_BUFFER, Config};
use crate::resource::Registries;
use crate::scheduler::Scheduler;
use crate::seed::SeedPeerDriver;

#[async_trait]
pub trait Event: Send + Sync {
    /// 路由 key。图变更类事件用 task id，管理类事件用 peer / host id
    fn hash_key(&self) -> &str;

    async fn apply(&self, ctx: &EventContext);
}

/// 事件处理要用到的全部依赖，启动时组装一次
pub struct EventContext {
    pub registries: Arc<Registries>,
    pub scheduler: Arc<Scheduler>,
    pub seed_driver: Arc<SeedPeerDriver>,
    pub sender: EventSender,
    pub config: Config,
    pub cancel_token: CancellationToken,
}

/// 入队句柄，随便 clone
#[derive(Clone)]
pub struct EventSender {
    queues: Arc<Vec<mpsc::Sender<Box<dyn Event>>>>,
}

impl EventSender {
    /// 按 key 路由入队。
    /// 注意不要在事件处理函数里往自己的分片入队，队列满了会卡死 worker
    pub async fn enqueue(&self, event: Box<dyn Event>) {
        let index = shard_index(event.hash_key(), self.queues.len());
        if self.queues[index].send(event).await.is_err() {
            warn!("事件队列 {index} 已关闭，事件被丢弃");
        }
    }
}

fn shard_index(key: &str, queue_num: usize) -> usize {
    let mut hasher = AHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() % queue_num as u64) as usize
}

/// 建好 N 条分片队列
pub fn channels(worker_num: usize) -> (EventSender, Vec<mpsc::Receiver<Box<dyn Event>>>) {
    assert!(worker_num > 0, "worker_num must be greater than 0");
    let mut senders = Vec::with_capacity(worker_num);
    let mut receivers = Vec::with_capacity(worker_num);
    for _ in 0..worker_num {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        senders.push(tx);
        receivers.push(rx);
    }
    (
        EventSender {
            queues: Arc::new(senders),
        },
        receivers,
    )
}

/// 每条队列起一个 worker
pub fn serve(
    ctx: Arc<EventContext>,
    receivers: Vec<mpsc::Receiver<Box<dyn Event>>>,
) -> Vec<JoinHandle<()>> {
    receivers
        .into_iter()
        .enumerate()
        .map(|(no, recv)| tokio::spawn(worker(no, recv, ctx.clone())))
        .collect()
}

async fn worker(no: usize, mut recv: mpsc::Receiver<Box<dyn Event>>, ctx: Arc<EventContext>) {
    info!("事件 worker {no} 已启动");
    loop {
        tokio::select! {
            _ = ctx.cancel_token.cancelled() => break,
            event = recv.recv() => {
                match event {
                    Some(event) => event.apply(&ctx).await,
                    None => break,
                }
            }
        }
    }
    info!("事件 worker {no} 已退出");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;
    use crate::seed::NoopSeedClient;

    #[test]
    fn test_shard_index_stable() {
        let a = shard_index("task-1", 8);
        assert_eq!(a, shard_index("task-1", 8));
        assert!(a < 8);
        assert_eq!(shard_index("anything", 1), 0);
    }

    struct OrderedEvent {
        key: String,
        producer: usize,
        seq: usize,
        log: Arc<Mutex<Vec<(usize, usize)>>>,
    }

    #[async_trait]
    impl Event for OrderedEvent {
        fn hash_key(&self) -> &str {
            &self.key
        }

        async fn apply(&self, _ctx: &EventContext) {
            self.log.lock().unwrap().push((self.producer, self.seq));
        }
    }

    fn test_ctx(sender: EventSender, cancel_token: CancellationToken) -> Arc<EventContext> {
        let config = Config::new();
        let registries = Arc::new(Registries::new(config.clone()));
        let scheduler = Arc::new(Scheduler::new(config.clone(), registries.clone()));
        let seed_driver = Arc::new(SeedPeerDriver::new(
            registries.clone(),
            Arc::new(NoopSeedClient),
            config.clone(),
        ));
        Arc::new(EventContext {
            registries,
            scheduler,
            seed_driver,
            sender,
            config,
            cancel_token,
        })
    }

    /// 多个生产者对同一个 key 交错入队，应用顺序有且只有一个，
    /// 且每个生产者自己的入队顺序被保留
    #[tokio::test]
    async fn test_same_key_events_apply_serially() {
        let (sender, receivers) = channels(4);
        let cancel_token = CancellationToken::new();
        let ctx = test_ctx(sender.clone(), cancel_token.clone());
        let handles = serve(ctx, receivers);

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut producers = Vec::new();
        for producer in 0..4 {
            let sender = sender.clone();
            let log = log.clone();
            producers.push(tokio::spawn(async move {
                for seq in 0..25 {
                    sender
                        .enqueue(Box::new(OrderedEvent {
                            key: "task-x".to_string(),
                            producer,
                            seq,
                            log: log.clone(),
                        }))
                        .await;
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        // 等队列排干
        for _ in 0..200 {
            if log.lock().unwrap().len() == 100 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let entries = log.lock().unwrap().clone();
        assert_eq!(entries.len(), 100);
        for producer in 0..4 {
            let seqs: Vec<usize> = entries
                .iter()
                .filter(|(p, _)| *p == producer)
                .map(|(_, s)| *s)
                .collect();
            assert_eq!(seqs, (0..25).collect::<Vec<_>>());
        }

        cancel_token.cancel();
        for mut handle in handles {
            diaodu_util::sync::wait_join_handle_close(&mut handle).await;
        }
    }
}
