pub mod memory;
pub mod proxy;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::ProxyRecord;

pub use memory::MemoryProxyStore;
pub use proxy::ProxyRepository;

/// Durable storage for pool members
#[async_trait]
pub trait ProxyStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<ProxyRecord>>;

    /// Insert or overwrite rows by key
    async fn upsert_many(&self, records: &[ProxyRecord]) -> Result<u64>;

    async fn delete_many(&self, keys: &[String]) -> Result<u64>;
}
