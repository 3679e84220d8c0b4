use crate::error::StoreError;
use crate::store::version::SchemaVersion;

/// Largest value accepted by `set` before the write is rejected as too large.
pub const DEFAULT_MAX_VALUE_BYTES: usize = 1 << 20;

/// Durable opaque key to bytes store for transport bookkeeping.
///
/// `set` retries transient failures a bounded number of times and then
/// surfaces the last error. Every operation after `close` returns
/// [`StoreError::Closed`]; closing twice is a no-op.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;
    fn close(&self) -> Result<(), StoreError>;
    fn schema_version(&self) -> SchemaVersion;
    fn driver(&self) -> &'static str;
}
