/// 状态存储层
///
/// 在键值后端之上提供类型化的读写、乐观并发控制和作用域分布式锁。
/// 调用方使用相对键（如 `servers/vm-00001`），命名空间由这里统一拼接。

pub mod backend;
#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;
pub mod sequence;

use common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

pub use backend::{KvBackend, KvRecord, LockToken};
pub use memory::MemoryKv;

/// read-modify-write 遇到冲突时的最大尝试次数
const MAX_UPDATE_ATTEMPTS: usize = 8;

/// 带修订号的记录
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    /// 相对键
    pub key: String,
    pub revision: i64,
    pub value: T,
}

/// 类型化状态存储
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn KvBackend>,
    namespace: String,
}

impl StateStore {
    pub fn new(backend: Arc<dyn KvBackend>, namespace: impl Into<String>) -> Self {
        let mut namespace = namespace.into();
        if !namespace.ends_with('/') {
            namespace.push('/');
        }
        Self { backend, namespace }
    }

    /// 基于内存后端的存储
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKv::new()), common::models::constants::DEFAULT_NAMESPACE)
    }

    pub fn backend_type(&self) -> &str {
        self.backend.backend_type()
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    fn relative_key(&self, key: &str) -> String {
        key.strip_prefix(self.namespace.as_str())
            .unwrap_or(key)
            .to_string()
    }

    fn decode<T: DeserializeOwned>(&self, record: KvRecord) -> Result<Versioned<T>> {
        let value = serde_json::from_slice(&record.value)?;
        Ok(Versioned {
            key: self.relative_key(&record.key),
            revision: record.mod_revision,
            value,
        })
    }

    /// 无条件覆盖写入
    pub async fn put<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<i64> {
        let bytes = serde_json::to_vec(value)?;
        self.backend.put(&self.full_key(key), bytes).await
    }

    /// 条件写入：修订号不匹配时返回 `UpdateConflict`，不做任何修改。
    /// `expected_revision` 为 0 表示键必须不存在。
    pub async fn put_cas<T: Serialize + Sync>(
        &self,
        key: &str,
        expected_revision: i64,
        value: &T,
    ) -> Result<i64> {
        let bytes = serde_json::to_vec(value)?;
        self.backend
            .put_cas(&self.full_key(key), expected_revision, bytes)
            .await
    }

    /// 仅当键不存在时创建
    pub async fn create<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<i64> {
        self.put_cas(key, 0, value).await
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Versioned<T>> {
        let record = self.backend.get(&self.full_key(key)).await?;
        self.decode(record)
    }

    /// 读取值，不存在时返回 None
    pub async fn find<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Versioned<T>>> {
        match self.get(key).await {
            Ok(v) => Ok(Some(v)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 按键顺序列出前缀下的所有记录
    pub async fn list<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<Versioned<T>>> {
        let records = self.backend.get_prefix(&self.full_key(prefix)).await?;
        records.into_iter().map(|r| self.decode(r)).collect()
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(&self.full_key(key)).await
    }

    /// 基于 CAS 的 read-modify-write，冲突时重新读取并重试。
    /// `f` 返回错误时放弃更新并原样返回该错误。
    pub async fn update<T, F>(&self, key: &str, mut f: F) -> Result<Versioned<T>>
    where
        T: Serialize + DeserializeOwned + Sync,
        F: FnMut(&mut T) -> Result<()>,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let mut current = self.get::<T>(key).await?;
            f(&mut current.value)?;

            match self.put_cas(key, current.revision, &current.value).await {
                Ok(revision) => {
                    current.revision = revision;
                    return Ok(current);
                }
                Err(Error::UpdateConflict(_)) => {
                    debug!("更新 {} 冲突，第 {} 次重试", key, attempt);
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::UpdateConflict(format!(
            "{} 连续 {} 次更新冲突",
            key, MAX_UPDATE_ATTEMPTS
        )))
    }

    /// 获得命名锁，返回的守卫被丢弃时自动释放
    pub async fn lock(&self, name: &str) -> Result<LockGuard> {
        let token = self
            .backend
            .lock(&self.full_key(&format!("locks/{}", name)))
            .await?;
        Ok(LockGuard {
            backend: self.backend.clone(),
            token: Some(token),
        })
    }

    pub async fn unlock(&self, guard: LockGuard) -> Result<()> {
        guard.release().await
    }

    /// 持有命名锁执行 `f`，`f` 成功、失败或调用方中途放弃时都会释放锁
    pub async fn with_lock<R, F, Fut>(&self, name: &str, f: F) -> Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let guard = self.lock(name).await?;
        let result = f().await;

        match guard.release().await {
            Ok(()) => result,
            Err(e) => {
                warn!("释放锁 {} 失败: {}", name, e);
                // 原操作的错误优先返回
                match result {
                    Ok(_) => Err(e),
                    Err(original) => Err(original),
                }
            }
        }
    }
}

/// 持有中的命名锁
///
/// 正常路径通过 `release` 释放；未释放就被丢弃时（任务被取消、调用方断开），
/// 在后台任务中补做释放。
pub struct LockGuard {
    backend: Arc<dyn KvBackend>,
    token: Option<LockToken>,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        self.token.as_ref().map(|t| t.name.as_str()).unwrap_or_default()
    }

    pub async fn release(mut self) -> Result<()> {
        match self.token.take() {
            Some(token) => self.backend.unlock(token).await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let backend = self.backend.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("锁 {} 未显式释放，后台释放", token.name);
                handle.spawn(async move {
                    let name = token.name.clone();
                    if let Err(e) = backend.unlock(token).await {
                        warn!("后台释放锁 {} 失败: {}", name, e);
                    }
                });
            }
            Err(_) => warn!("没有可用的运行时，锁 {} 只能等待会话过期后释放", token.name),
        }
    }
}
