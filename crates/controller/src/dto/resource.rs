/// 存储卷、虚拟网络和调度请求

use common::models::{ForwardMode, VolumeBackendType, VolumeKind, VolumeSource};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// 创建存储卷请求
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct VolumeRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,

    pub backend: VolumeBackendType,

    pub kind: VolumeKind,

    #[validate(range(min = 1))]
    pub size_bytes: u64,

    /// LVM 卷组；从快照创建时可省略，使用源卷所在卷组
    pub vg: Option<String>,

    pub source: Option<VolumeSource>,
}

/// 创建虚拟网络请求
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NetworkRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,

    /// Linux 网卡名最长 15 字节
    #[validate(length(min = 1, max = 15))]
    pub bridge: String,

    pub ip_pool_id: Option<String>,

    #[serde(default)]
    pub forward_mode: ForwardMode,
}

/// 调度一台新虚拟机
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewServer {
    pub host_name: String,
    pub cluster_name: String,
    pub cpu: u32,
    pub memory_mb: u64,
    pub os_variant: String,
    pub boot_volume: Option<String>,
    pub data_volumes: Vec<String>,
    /// 虚拟网络 id，地址在创建虚拟机时分配
    pub networks: Vec<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
}
