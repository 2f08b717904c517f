/// 配置管理
///
/// 优先级：内置默认值 < 环境变量（`FLEET_` 前缀，例如 `FLEET_LISTEN_PORT`）

use common::models::constants;
use serde::Deserialize;
use std::time::Duration;

use crate::backends::DispatchPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen_port: u16,
    pub log_level: String,
    /// 逗号分隔的 etcd 地址
    pub etcd_endpoints: String,
    pub namespace: String,
    pub lock_ttl_secs: i64,
    pub reconcile_interval_secs: u64,
    pub volume_grace_secs: u64,
    pub server_grace_secs: u64,
    pub network_grace_secs: u64,
    pub provisioning_timeout_secs: u64,
    pub agent_timeout_secs: u64,
    pub agent_max_attempts: u32,
    pub agent_backoff_base_ms: u64,
    pub agent_backoff_max_ms: u64,
    /// 磁盘镜像类型存储卷的存放目录
    pub image_dir: String,
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> anyhow::Result<Self> {
        let cfg = config::Config::builder()
            .set_default("listen_port", 3000)?
            .set_default("log_level", "debug")?
            .set_default("etcd_endpoints", "http://127.0.0.1:2379")?
            .set_default("namespace", constants::DEFAULT_NAMESPACE)?
            .set_default("lock_ttl_secs", 30)?
            .set_default("reconcile_interval_secs", constants::DEFAULT_RECONCILE_INTERVAL)?
            .set_default("volume_grace_secs", constants::VOLUME_DELETION_GRACE)?
            .set_default("server_grace_secs", constants::SERVER_DELETION_GRACE)?
            .set_default("network_grace_secs", constants::NETWORK_DELETION_GRACE)?
            .set_default("provisioning_timeout_secs", 600)?
            .set_default("agent_timeout_secs", 30)?
            .set_default("agent_max_attempts", 1)?
            .set_default("agent_backoff_base_ms", 500)?
            .set_default("agent_backoff_max_ms", 5000)?
            .set_default("image_dir", "/var/lib/easy-vm-fleet/images")?
            .add_source(config::Environment::with_prefix("FLEET").try_parsing(true))
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    pub fn etcd_endpoints(&self) -> Vec<String> {
        self.etcd_endpoints
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_secs(self.provisioning_timeout_secs)
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            timeout: Duration::from_secs(self.agent_timeout_secs),
            max_attempts: self.agent_max_attempts,
            backoff_base: Duration::from_millis(self.agent_backoff_base_ms),
            backoff_max: Duration::from_millis(self.agent_backoff_max_ms),
            ..DispatchPolicy::default()
        }
    }
}
