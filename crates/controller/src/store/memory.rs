/// 内存键值存储
///
/// 单进程内实现与 etcd 相同的修订号语义，用于测试和本地开发

use async_trait::async_trait;
use common::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::backend::{KvBackend, KvRecord, LockToken};

#[derive(Default)]
struct MemoryState {
    /// 全局修订号，每次写入递增
    revision: i64,
    /// key -> (value, mod_revision)
    data: BTreeMap<String, (Vec<u8>, i64)>,
}

/// 内存键值存储
#[derive(Default)]
pub struct MemoryKv {
    state: Mutex<MemoryState>,
    /// 锁名称 -> 互斥量
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// 锁键 -> 持有中的守卫
    held: Mutex<HashMap<Vec<u8>, OwnedMutexGuard<()>>>,
    next_lock_id: AtomicU64,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64> {
        let mut state = self.state.lock().await;
        state.revision += 1;
        let revision = state.revision;
        state.data.insert(key.to_string(), (value, revision));
        Ok(revision)
    }

    async fn put_cas(&self, key: &str, expected_revision: i64, value: Vec<u8>) -> Result<i64> {
        let mut state = self.state.lock().await;
        let current = state.data.get(key).map(|(_, rev)| *rev).unwrap_or(0);
        if current != expected_revision {
            return Err(Error::UpdateConflict(format!(
                "{} 的修订号为 {}，期望 {}",
                key, current, expected_revision
            )));
        }
        state.revision += 1;
        let revision = state.revision;
        state.data.insert(key.to_string(), (value, revision));
        Ok(revision)
    }

    async fn get(&self, key: &str) -> Result<KvRecord> {
        let state = self.state.lock().await;
        state
            .data
            .get(key)
            .map(|(value, rev)| KvRecord {
                key: key.to_string(),
                value: value.clone(),
                mod_revision: *rev,
            })
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KvRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (value, rev))| KvRecord {
                key: key.clone(),
                value: value.clone(),
                mod_revision: *rev,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.data.remove(key).is_some() {
            state.revision += 1;
        }
        Ok(())
    }

    async fn lock(&self, name: &str) -> Result<LockToken> {
        let mutex = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let guard = mutex.lock_owned().await;
        let id = self.next_lock_id.fetch_add(1, Ordering::SeqCst);
        let key = format!("{}/{:x}", name, id).into_bytes();
        self.held.lock().await.insert(key.clone(), guard);

        debug!("获得内存锁: {}", name);
        Ok(LockToken {
            name: name.to_string(),
            key,
            lease: None,
        })
    }

    async fn unlock(&self, token: LockToken) -> Result<()> {
        match self.held.lock().await.remove(&token.key) {
            Some(_guard) => {
                debug!("释放内存锁: {}", token.name);
                Ok(())
            }
            None => Err(Error::NotFound(format!("锁 {} 未被持有", token.name))),
        }
    }

    fn backend_type(&self) -> &str {
        "memory"
    }
}
