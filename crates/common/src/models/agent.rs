/// 宿主机 Agent HTTP 接口的数据类型
///
/// 请求和响应均为 JSON

use serde::{Deserialize, Serialize};

// ============================================================================
// 虚拟机管理
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmSpec {
    pub vm_id: String,
    pub host_name: String,
    pub cluster_name: String,
    pub vcpu: u32,
    pub memory_mb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateDisk>,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    #[serde(default)]
    pub networks: Vec<NetworkInterfaceSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
}

/// 系统模板所在的卷组/逻辑卷，由 Agent 克隆为启动盘
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateDisk {
    pub os_variant: String,
    pub vg: String,
    pub lv: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskSpec {
    pub volume_id: String,
    pub bootable: bool,
    pub volume_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInterfaceSpec {
    pub network_id: String,
    pub bridge_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

/// Agent 通用响应
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AgentResponse {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    /// 异步操作的后续查询地址
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl AgentResponse {
    /// code 为 0 或 2xx 视为成功
    pub fn is_success(&self) -> bool {
        self.code == 0 || (200..300).contains(&self.code)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentVersion {
    pub version: String,
    #[serde(default)]
    pub hypervisor: String,
}
