//! 键值存储抽象：会话快照、幂等键、观测日志、审计记录共用一个 KvStore
//!
//! 键布局：
//! - `session/{id}`：稳定状态下的会话快照
//! - `idem/{key}`：start_session 幂等键 -> 会话 ID
//! - `obs/{session}/{seq:020}`：观测日志（按序号排序）
//! - `obs_seen/{session}`：已接受序号的区间集合（淘汰时不删除）
//! - `artifact/{session}/{step}/{attempt:06}`：核验审计记录（只增不改）

pub mod memory;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::StoreError;

pub use memory::MemoryKvStore;
pub use sqlite::SqliteKvStore;

/// 键值存储接口；值为 JSON 编码的字节
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// 覆盖写
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// 仅当键不存在时写入，返回是否写入成功
    async fn insert_new(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// 按键的字典序返回所有以 prefix 开头的条目
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

pub fn session_key(session_id: &str) -> String {
    format!("session/{session_id}")
}

pub fn idempotency_key(key: &str) -> String {
    format!("idem/{key}")
}

pub fn observation_prefix(session_id: &str) -> String {
    format!("obs/{session_id}/")
}

pub fn observation_key(session_id: &str, sequence: u64) -> String {
    format!("obs/{session_id}/{sequence:020}")
}

pub fn accepted_sequences_key(session_id: &str) -> String {
    format!("obs_seen/{session_id}")
}

pub fn artifact_prefix(session_id: &str) -> String {
    format!("artifact/{session_id}/")
}

pub fn artifact_step_prefix(session_id: &str, step_id: &str) -> String {
    format!("artifact/{session_id}/{step_id}/")
}

pub fn artifact_key(session_id: &str, step_id: &str, attempt: u32) -> String {
    format!("artifact/{session_id}/{step_id}/{attempt:06}")
}

pub fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

pub fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// 读取并反序列化
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(bytes) => decode(key, &bytes).map(Some),
        None => Ok(None),
    }
}

/// 序列化并覆盖写
pub async fn save_json<T: Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    store.put(key, encode(key, value)?).await
}

/// 按配置创建存储：给定 sqlite 路径时必须能打开，否则返回错误；未配置时使用内存存储
pub fn create_kv_store(sqlite_path: Option<&Path>) -> Result<Arc<dyn KvStore>, StoreError> {
    match sqlite_path {
        Some(path) => {
            let store = SqliteKvStore::open(path)?;
            tracing::info!(path = %path.display(), "Using sqlite store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("No sqlite_path configured, using in-memory store");
            Ok(Arc::new(MemoryKvStore::new()))
        }
    }
}
