//! 启动装配。注册表、调度器、种子驱动、事件循环、GC 在这里
//! 构造一次，然后按引用传下去，不留全局状态。

use std::sync::Arc;

use diaodu_util::sync::wait_join_handles_close;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::event::{self, EventContext};
use crate::gc::Gc;
use crate::resource::Registries;
use crate::scheduler::Scheduler;
use crate::seed::{SeedClient, SeedPeerDriver};
use crate::service::SchedService;

pub struct Server {
    service: Arc<SchedService>,

    cancel_token: CancellationToken,

    handles: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn service(&self) -> Arc<SchedService> {
        self.service.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 停机：广播取消信号，等所有 worker 退出
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        wait_join_handles_close(self.handles.iter_mut()).await;
        info!("diaodu 调度器已退出");
    }
}

pub async fn start(config: Config, seed_client: Arc<dyn SeedClient>) -> Server {
    info!("diaodu 调度器启动中...");
    let cancel_token = CancellationToken::new();

    let registries = Arc::new(Registries::new(config.clone()));
    // 种子主机先入表，种子 peer 初始化要靠它
    for host in config.seed_hosts() {
        registries.hosts().upsert(host);
    }

    let scheduler = Arc::new(Scheduler::new(config.clone(), registries.clone()));
    let seed_driver = Arc::new(SeedPeerDriver::new(
        registries.clone(),
        seed_client,
        config.clone(),
    ));

    let (sender, receivers) = event::channels(config.scheduler_worker_num());
    let ctx = Arc::new(EventContext {
        registries: registries.clone(),
        scheduler: scheduler.clone(),
        seed_driver: seed_driver.clone(),
        sender: sender.clone(),
        config: config.clone(),
        cancel_token: cancel_token.clone(),
    });
    let mut handles = event::serve(ctx, receivers);

    let gc = Gc::new(
        registries.clone(),
        sender.clone(),
        config.clone(),
        cancel_token.clone(),
    );
    handles.push(tokio::spawn(gc.run()));

    let service = Arc::new(SchedService::new(
        registries,
        scheduler,
        seed_driver,
        sender,
        config,
        cancel_token.clone(),
    ));

    info!("diaodu 调度器运行中...");
    Server {
        service,
        cancel_token,
        handles,
    }
}
