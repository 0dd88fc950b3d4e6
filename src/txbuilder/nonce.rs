//! Nonce manager.
//!
//! Per-address monotonic allocator. The first allocation after startup or a
//! reset queries the chain's pending nonce; subsequent allocations hand out
//! contiguous values from the cache. Callers must reset an address on any
//! signing or send failure so the next allocation re-syncs with the chain.

use std::collections::HashMap;
use std::sync::Arc;

use ethers::types::Address;
use tokio::sync::Mutex;
use tracing::debug;

use crate::blockchain::ChainClient;
use crate::errors::BuilderError;

#[derive(Debug)]
pub struct NonceManager {
    client: Arc<dyn ChainClient>,
    next: Mutex<HashMap<Address, u64>>,
}

impl NonceManager {
    pub fn new(client: Arc<dyn ChainClient>) -> Self {
        Self {
            client,
            next: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates the next nonce for `addr`.
    pub async fn next(&self, addr: Address) -> Result<u64, BuilderError> {
        let mut next = self.next.lock().await;
        if let Some(cached) = next.get_mut(&addr) {
            let nonce = *cached;
            *cached = nonce + 1;
            return Ok(nonce);
        }
        let pending = self.client.pending_nonce(addr).await?;
        next.insert(addr, pending + 1);
        debug!(target: "nonce", address = %format!("{addr:#x}"), pending, "nonce cache primed");
        Ok(pending)
    }

    /// Drops the cached entry for `addr`; the next allocation re-queries
    /// the chain.
    pub async fn reset(&self, addr: Address) {
        self.next.lock().await.remove(&addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txbuilder::testutil::MockChainClient;
    use std::sync::atomic::Ordering;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    #[tokio::test]
    async fn allocations_are_contiguous_from_pending() {
        let client = Arc::new(MockChainClient::new());
        client.pending_nonce.store(7, Ordering::SeqCst);
        let manager = NonceManager::new(client.clone());

        assert_eq!(manager.next(addr(1)).await.unwrap(), 7);
        assert_eq!(manager.next(addr(1)).await.unwrap(), 8);
        assert_eq!(manager.next(addr(1)).await.unwrap(), 9);
        // only the first allocation hit the chain
        assert_eq!(client.nonce_queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn addresses_are_tracked_independently() {
        let client = Arc::new(MockChainClient::new());
        client.pending_nonce.store(3, Ordering::SeqCst);
        let manager = NonceManager::new(client);

        assert_eq!(manager.next(addr(1)).await.unwrap(), 3);
        assert_eq!(manager.next(addr(2)).await.unwrap(), 3);
        assert_eq!(manager.next(addr(1)).await.unwrap(), 4);
        assert_eq!(manager.next(addr(2)).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn reset_forces_a_fresh_chain_query() {
        let client = Arc::new(MockChainClient::new());
        client.pending_nonce.store(10, Ordering::SeqCst);
        let manager = NonceManager::new(client.clone());

        assert_eq!(manager.next(addr(1)).await.unwrap(), 10);
        assert_eq!(manager.next(addr(1)).await.unwrap(), 11);

        // a rejected submission leaves the chain at a different nonce
        manager.reset(addr(1)).await;
        client.pending_nonce.store(10, Ordering::SeqCst);
        assert_eq!(manager.next(addr(1)).await.unwrap(), 10);
        assert_eq!(client.nonce_queries.load(Ordering::SeqCst), 2);
    }
}
