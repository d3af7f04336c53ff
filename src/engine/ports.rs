//! 端口池 (Port Pool)
//!
//! 固定区间 `[base, base+n)` 的探测端口租借。信号量限制并发租借数，
//! 租约按 RAII 归还，工作任务 panic 也不会泄漏槽位。

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// 静态端口池
pub struct PortPool {
    base: u16,
    slots: Arc<Mutex<Vec<bool>>>,
    sem: Arc<Semaphore>,
}

/// 端口租约，drop 时归还槽位
pub struct PortLease {
    port: u16,
    index: usize,
    slots: Arc<Mutex<Vec<bool>>>,
    _permit: OwnedSemaphorePermit,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.slots.lock()[self.index] = false;
    }
}

impl PortPool {
    pub fn new(base: u16, count: usize) -> Self {
        Self {
            base,
            slots: Arc::new(Mutex::new(vec![false; count])),
            sem: Arc::new(Semaphore::new(count)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// 阻塞等待空闲端口；撤回令牌触发时返回 `None`
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<PortLease> {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return None,
            permit = self.sem.clone().acquire_owned() => permit.ok()?,
        };

        // 信号量保证至少存在一个空闲槽位
        let index = {
            let mut slots = self.slots.lock();
            let idx = slots
                .iter()
                .position(|used| !used)
                .expect("semaphore permit implies a free slot");
            slots[idx] = true;
            idx
        };

        Some(PortLease {
            port: self.base + index as u16,
            index,
            slots: self.slots.clone(),
            _permit: permit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    #[tokio::test]
    async fn leases_are_unique_and_returned() {
        let pool = PortPool::new(21000, 3);
        let cancel = CancellationToken::new();

        let a = pool.acquire(&cancel).await.unwrap();
        let b = pool.acquire(&cancel).await.unwrap();
        let c = pool.acquire(&cancel).await.unwrap();

        let ports: HashSet<u16> = [a.port(), b.port(), c.port()].into_iter().collect();
        assert_eq!(ports.len(), 3);
        assert!(ports.iter().all(|p| (21000..21003).contains(p)));

        // 满载时第四次租借必须等待
        let waiter = tokio::time::timeout(Duration::from_millis(50), pool.acquire(&cancel)).await;
        assert!(waiter.is_err());

        drop(b);
        let d = pool.acquire(&cancel).await.unwrap();
        assert_eq!(d.port(), 21001);
    }

    #[tokio::test]
    async fn cancellation_unblocks_acquire() {
        let pool = PortPool::new(21100, 1);
        let cancel = CancellationToken::new();
        let _held = pool.acquire(&cancel).await.unwrap();

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });

        assert!(pool.acquire(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_workers_never_share_a_slot() {
        let pool = Arc::new(PortPool::new(21200, 4));
        let cancel = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let pool = pool.clone();
            let cancel = cancel.clone();
            let seen = seen.clone();
            handles.push(tokio::spawn(async move {
                let lease = pool.acquire(&cancel).await.unwrap();
                {
                    let mut active = seen.lock();
                    assert!(!active.contains(&lease.port()), "slot double-leased");
                    active.push(lease.port());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                seen.lock().retain(|p| *p != lease.port());
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }
}
