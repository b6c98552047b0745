//! 对传输层暴露的服务门面。

pub mod sched_service;

pub use sched_service::{SchedError, SchedService};
