/// 键值存储后端抽象
///
/// 要求后端是线性一致的，并为每个键维护修改修订号（mod revision）

use async_trait::async_trait;
use common::Result;

/// 原始键值记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvRecord {
    pub key: String,
    pub value: Vec<u8>,
    /// 键最后一次修改时的修订号，不存在的键视为 0
    pub mod_revision: i64,
}

/// 分布式锁凭证，释放时原样交回
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub name: String,
    /// 后端返回的锁键
    pub key: Vec<u8>,
    /// 持有锁的会话租约
    pub lease: Option<i64>,
}

/// 键值存储后端
///
/// 所有键都是完整键（已包含命名空间），由 `StateStore` 负责拼接
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    /// 无条件写入，返回新的修订号
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64>;

    /// 仅当键的当前修订号等于 `expected_revision` 时写入，否则返回 `UpdateConflict`
    async fn put_cas(&self, key: &str, expected_revision: i64, value: Vec<u8>) -> Result<i64>;

    async fn get(&self, key: &str) -> Result<KvRecord>;

    /// 按键顺序返回前缀下的所有记录
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KvRecord>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// 阻塞直到获得锁
    async fn lock(&self, name: &str) -> Result<LockToken>;

    async fn unlock(&self, token: LockToken) -> Result<()>;

    /// 后端类型名称，用于日志
    fn backend_type(&self) -> &str;
}
