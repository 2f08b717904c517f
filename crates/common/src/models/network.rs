/// 虚拟网络模型

use serde::{Deserialize, Serialize};

use super::ResourceMeta;

/// 虚拟网络状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Pending,
    Provisioning,
    Active,
    Error,
    Deleting,
}

impl NetworkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkStatus::Pending => "pending",
            NetworkStatus::Provisioning => "provisioning",
            NetworkStatus::Active => "active",
            NetworkStatus::Error => "error",
            NetworkStatus::Deleting => "deleting",
        }
    }
}

/// 转发模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    #[default]
    Nat,
    Route,
    Bridge,
    Isolated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkMetadata {
    pub name: String,
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkSpec {
    pub bridge: String,
    /// 关联的 IP 地址池（IpNetwork id）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_pool_id: Option<String>,
    #[serde(default)]
    pub forward_mode: ForwardMode,
}

/// 虚拟网络记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualNetwork {
    pub id: String,
    pub metadata: NetworkMetadata,
    pub spec: NetworkSpec,
    /// 部署时从地址池分配的网关地址
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    pub status: NetworkStatus,
    pub meta: ResourceMeta,
}
