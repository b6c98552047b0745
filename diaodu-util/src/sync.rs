use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::task::JoinHandle;
use tracing::{error, warn};

pub trait MutexExt<T> {
    fn lock_pe(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_pe(&self) -> MutexGuard<'_, T> {
        match self.lock() {
            Ok(mg) => mg,
            Err(pe) => {
                warn!("Mutex poisoned: {}", pe);
                pe.into_inner()
            }
        }
    }
}

pub trait RwLockExt<T> {
    fn read_pe(&self) -> RwLockReadGuard<'_, T>;

    fn write_pe(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> RwLockExt<T> for RwLock<T> {
    fn read_pe(&self) -> RwLockReadGuard<'_, T> {
        match self.read() {
            Ok(rg) => rg,
            Err(pe) => {
                warn!("RwLock poisoned: {}", pe);
                pe.into_inner()
            }
        }
    }

    fn write_pe(&self) -> RwLockWriteGuard<'_, T> {
        match self.write() {
            Ok(wg) => wg,
            Err(pe) => {
                warn!("RwLock poisoned: {}", pe);
                pe.into_inner()
            }
        }
    }
}

/// 发出中断信号并等待所有 JoinHandle 完成
/// 一般用于退出后清理子线程
pub async fn wait_join_handles_close(handles: impl Iterator<Item = &mut JoinHandle<()>>) {
    for handle in handles {
        wait_join_handle_close(handle).await;
    }
}

/// 发出中断信号并等待 JoinHandle 完成
/// 一般用于退出后清理子线程
pub async fn wait_join_handle_close(handle: &mut JoinHandle<()>) {
    handle.abort();
    if let Err(e) = handle.await {
        if e.is_panic() {
            error!("JoinHandle panicked: {}", e);
        }
    }
}
