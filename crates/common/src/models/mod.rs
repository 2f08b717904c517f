/// 共享数据模型
///
/// 定义持久化在状态存储中的全部记录结构，每类记录一个模块

pub mod agent;
pub mod hypervisor;
pub mod ipam;
pub mod network;
pub mod server;
pub mod volume;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use hypervisor::{Hypervisor, HypervisorStatus, OsTemplate, Placement, StoragePool};
pub use ipam::{IpAddressRecord, IpNetwork};
pub use network::{ForwardMode, NetworkMetadata, NetworkSpec, NetworkStatus, VirtualNetwork};
pub use server::{NetworkAttachment, Server, ServerStatus};
pub use volume::{Volume, VolumeBackendType, VolumeKind, VolumeLocation, VolumeSource, VolumeStatus};

/// 带状态资源的公共元数据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceMeta {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 一旦设置就不再清除
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// 进入 ERROR 状态时后端返回的错误信息
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ResourceMeta {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            deletion_timestamp: None,
            last_error: None,
        }
    }

    /// 刷新更新时间
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// 标记删除，已标记过的保持原时间戳不变；返回本次是否新设置
    pub fn mark_for_deletion(&mut self, at: DateTime<Utc>) -> bool {
        if self.deletion_timestamp.is_some() {
            return false;
        }
        self.deletion_timestamp = Some(at);
        true
    }

    /// 删除标记是否已超过宽限期
    pub fn deletion_due(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        match self.deletion_timestamp {
            Some(ts) => now
                .signed_duration_since(ts)
                .to_std()
                .map(|elapsed| elapsed >= grace)
                .unwrap_or(false),
            None => false,
        }
    }

    /// 距离上次更新是否已超过给定时长
    pub fn stale_for(&self, now: DateTime<Utc>, limit: Duration) -> bool {
        now.signed_duration_since(self.updated_at)
            .to_std()
            .map(|elapsed| elapsed >= limit)
            .unwrap_or(false)
    }
}

impl Default for ResourceMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// 命名单调递增计数器，用于生成可读的资源名称
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sequence {
    pub name: String,
    pub start: u64,
    pub step: u64,
    /// 下一次分配出去的值
    pub next: u64,
}

impl Sequence {
    pub fn new(name: impl Into<String>, start: u64, step: u64) -> Self {
        Self {
            name: name.into(),
            start,
            step,
            next: start,
        }
    }
}

/// 键空间版本标记
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionMarker {
    pub schema_version: u32,
    pub written_at: DateTime<Utc>,
}

/// 常量定义
pub mod constants {
    /// 当前键空间结构版本
    pub const SCHEMA_VERSION: u32 = 1;

    /// 默认命名空间
    pub const DEFAULT_NAMESPACE: &str = "/easy-vm-fleet/";

    /// 默认控制器轮询间隔（秒）
    pub const DEFAULT_RECONCILE_INTERVAL: u64 = 5;

    /// 存储卷删除宽限期（秒）
    pub const VOLUME_DELETION_GRACE: u64 = 10;

    /// 虚拟机删除宽限期（秒）
    pub const SERVER_DELETION_GRACE: u64 = 10;

    /// 虚拟网络删除宽限期（秒）
    pub const NETWORK_DELETION_GRACE: u64 = 30;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_deletion_timestamp_is_monotonic() {
        let mut meta = ResourceMeta::new();
        let first = Utc::now() - ChronoDuration::seconds(60);
        assert!(meta.mark_for_deletion(first));
        assert!(!meta.mark_for_deletion(Utc::now()));
        assert_eq!(meta.deletion_timestamp, Some(first));
    }

    #[test]
    fn test_deletion_due_respects_grace() {
        let mut meta = ResourceMeta::new();
        let now = Utc::now();
        assert!(!meta.deletion_due(now, Duration::from_secs(10)));

        meta.mark_for_deletion(now - ChronoDuration::seconds(5));
        assert!(!meta.deletion_due(now, Duration::from_secs(10)));
        assert!(meta.deletion_due(now, Duration::from_secs(5)));

        // 时钟回拨时不触发删除
        let mut future = ResourceMeta::new();
        future.mark_for_deletion(now + ChronoDuration::seconds(30));
        assert!(!future.deletion_due(now, Duration::ZERO));
    }
}
