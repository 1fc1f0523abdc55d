use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::sync::Notify;

/// Pool of candidate peer-server addresses for the subscriber's connect
/// loop. Addresses are handed out FIFO and can be returned with
/// [ServerPool::consider] when a connection attempt failed or the resulting
/// peer was not admitted.
#[derive(Clone)]
pub struct ServerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    state: Mutex<PoolState>,
    available: Notify,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<SocketAddr>,
    /// Mirror of `queue` for duplicate suppression.
    members: FxHashSet<SocketAddr>,
}

impl ServerPool {
    pub fn new(srvr_addrs: impl IntoIterator<Item = SocketAddr>) -> ServerPool {
        let pool = ServerPool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
                available: Notify::new(),
            }),
        };
        for addr in srvr_addrs {
            pool.consider(addr);
        }
        pool
    }

    /// Takes the next address, waiting until one is available.
    pub async fn pop(&self) -> SocketAddr {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            {
                let mut state = self.inner.state.lock();
                if let Some(addr) = state.queue.pop_front() {
                    state.members.remove(&addr);
                    return addr;
                }
            }
            notified.await;
        }
    }

    /// Returns an address to the pool. Idempotent: an address that is already
    /// queued is not queued twice.
    pub fn consider(&self, srvr_addr: SocketAddr) {
        let mut state = self.inner.state.lock();
        if state.members.insert(srvr_addr) {
            state.queue.push_back(srvr_addr);
            self.inner.available.notify_one();
        }
    }

    pub fn size(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}
