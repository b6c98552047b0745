use std::sync::Arc;

use diaodu::bootstrap;
use diaodu::config::Config;
use diaodu::seed::NoopSeedClient;
use diaodu_util::default_logger;
use tracing::Level;

default_logger!(Level::INFO);

#[tokio::main]
async fn main() {
    // 种子集群客户端由传输侧接入，独立跑的时候用占位实现并关掉做种
    let config = Config::new().set_seed_enabled(false);
    let server = bootstrap::start(config, Arc::new(NoopSeedClient)).await;

    tokio::signal::ctrl_c().await.ok();
    server.shutdown().await;
}
