/// 虚拟机（Server）模型

use serde::{Deserialize, Serialize};

use super::{Placement, ResourceMeta};

/// 虚拟机状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Initializing,
    Provisioning,
    Running,
    Stopped,
    Deleting,
    Error,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Initializing => "initializing",
            ServerStatus::Provisioning => "provisioning",
            ServerStatus::Running => "running",
            ServerStatus::Stopped => "stopped",
            ServerStatus::Deleting => "deleting",
            ServerStatus::Error => "error",
        }
    }
}

/// 虚拟机的网络接入
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub network_id: String,
    /// 从网络关联的地址池中分配的地址
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// 虚拟机记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Server {
    pub id: String,
    pub host_name: String,
    pub cluster_name: String,
    pub cpu: u32,
    pub memory_mb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<Placement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_volume: Option<String>,
    #[serde(default)]
    pub data_volumes: Vec<String>,
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    pub os_variant: String,
    pub status: ServerStatus,
    pub meta: ResourceMeta,
}

impl Server {
    /// 是否属于指定集群中的指定主机名
    pub fn is(&self, host_name: &str, cluster_name: &str) -> bool {
        self.host_name == host_name && self.cluster_name == cluster_name
    }

    /// 已占用的公网/内网地址
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.public_ip
            .as_deref()
            .into_iter()
            .chain(self.private_ip.as_deref())
    }
}
