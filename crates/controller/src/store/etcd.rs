/// etcd v3 键值存储后端
///
/// 锁绑定在租约上，持有期间后台任务定期续约；进程退出后租约过期，锁自动释放

use async_trait::async_trait;
use common::{Error, Result};
use etcd_client::{Client, Compare, CompareOp, GetOptions, LockOptions, Txn, TxnOp};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{KvBackend, KvRecord, LockToken};

fn store_err(e: etcd_client::Error) -> Error {
    Error::Store(e.to_string())
}

/// 租约续约任务，被丢弃时停止续约，租约在 TTL 后自然过期
struct Keeper(JoinHandle<()>);

impl Drop for Keeper {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// etcd 后端
pub struct EtcdKv {
    client: Client,
    /// 锁会话租约 TTL（秒）
    lock_ttl: i64,
    /// 租约 ID -> 续约任务
    keepers: Mutex<HashMap<i64, Keeper>>,
}

impl EtcdKv {
    /// 连接 etcd 集群
    pub async fn connect(endpoints: &[String], lock_ttl: i64) -> Result<Self> {
        info!("正在连接 etcd: {:?}", endpoints);
        let client = Client::connect(endpoints, None).await.map_err(store_err)?;
        info!("etcd 连接成功");

        Ok(Self {
            client,
            lock_ttl,
            keepers: Mutex::new(HashMap::new()),
        })
    }

    fn spawn_keeper(&self, lease: i64) -> Keeper {
        let mut client = self.client.clone();
        let period = Duration::from_secs((self.lock_ttl / 3).max(1) as u64);

        Keeper(tokio::spawn(async move {
            let (mut keeper, mut stream) = match client.lease_keep_alive(lease).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("租约 {} 续约失败: {}", lease, e);
                    return;
                }
            };

            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = keeper.keep_alive().await {
                    warn!("租约 {} 续约失败: {}", lease, e);
                    return;
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {}
                    Ok(_) => {
                        warn!("租约 {} 已过期", lease);
                        return;
                    }
                    Err(e) => {
                        warn!("租约 {} 续约响应异常: {}", lease, e);
                        return;
                    }
                }
            }
        }))
    }
}

#[async_trait]
impl KvBackend for EtcdKv {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64> {
        let mut client = self.client.clone();
        let resp = client.put(key, value, None).await.map_err(store_err)?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default())
    }

    async fn put_cas(&self, key: &str, expected_revision: i64, value: Vec<u8>) -> Result<i64> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(key, CompareOp::Equal, expected_revision)])
            .and_then(vec![TxnOp::put(key, value, None)]);

        let resp = client.txn(txn).await.map_err(store_err)?;
        if !resp.succeeded() {
            return Err(Error::UpdateConflict(format!(
                "{} 的修订号已不是 {}",
                key, expected_revision
            )));
        }
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default())
    }

    async fn get(&self, key: &str) -> Result<KvRecord> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await.map_err(store_err)?;
        let kv = resp
            .kvs()
            .first()
            .ok_or_else(|| Error::NotFound(key.to_string()))?;

        Ok(KvRecord {
            key: key.to_string(),
            value: kv.value().to_vec(),
            mod_revision: kv.mod_revision(),
        })
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KvRecord>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(store_err)?;

        resp.kvs()
            .iter()
            .map(|kv| {
                Ok(KvRecord {
                    key: kv.key_str().map_err(store_err)?.to_string(),
                    value: kv.value().to_vec(),
                    mod_revision: kv.mod_revision(),
                })
            })
            .collect()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        client.delete(key, None).await.map_err(store_err)?;
        Ok(())
    }

    async fn lock(&self, name: &str) -> Result<LockToken> {
        let mut client = self.client.clone();
        let lease = client
            .lease_grant(self.lock_ttl, None)
            .await
            .map_err(store_err)?
            .id();

        let keeper = self.spawn_keeper(lease);
        let resp = match client
            .lock(name, Some(LockOptions::new().with_lease(lease)))
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                drop(keeper);
                if let Err(revoke_err) = client.lease_revoke(lease).await {
                    warn!("撤销租约 {} 失败: {}", lease, revoke_err);
                }
                return Err(store_err(e));
            }
        };
        self.keepers.lock().await.insert(lease, keeper);

        debug!("获得分布式锁: {} (lease={})", name, lease);
        Ok(LockToken {
            name: name.to_string(),
            key: resp.key().to_vec(),
            lease: Some(lease),
        })
    }

    async fn unlock(&self, token: LockToken) -> Result<()> {
        // 先停止续约，即使后续调用被中途放弃，租约也会在 TTL 后过期
        if let Some(lease) = token.lease {
            self.keepers.lock().await.remove(&lease);
        }

        let mut client = self.client.clone();
        let unlocked = client.unlock(token.key.clone()).await.map_err(store_err);

        if let Some(lease) = token.lease {
            // 撤销租约保证即使 unlock 失败锁键也会被删除
            if let Err(e) = client.lease_revoke(lease).await {
                warn!("撤销租约 {} 失败: {}", lease, e);
            }
        }

        unlocked?;
        debug!("释放分布式锁: {}", token.name);
        Ok(())
    }

    fn backend_type(&self) -> &str {
        "etcd"
    }
}
