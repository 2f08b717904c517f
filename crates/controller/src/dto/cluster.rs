/// 集群编排 DTO

use serde::{Deserialize, Serialize};
use validator::Validate;

/// 创建集群请求
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ClusterConfig {
    #[validate(length(min = 1, max = 63))]
    pub cluster_name: String,

    /// 系统模板（操作系统变体）
    #[validate(length(min = 1, max = 255))]
    pub os_variant: String,

    #[validate(length(min = 1))]
    pub vms: Vec<VmConfig>,
}

/// 单台虚拟机的配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct VmConfig {
    #[validate(length(min = 1, max = 63))]
    pub host_name: String,

    #[validate(range(min = 1, max = 512))]
    pub cpu: u32,

    #[validate(range(min = 64))]
    pub memory_mb: u64,

    pub public_ip: Option<String>,
    pub private_ip: Option<String>,

    /// 已创建好的启动盘
    #[serde(default)]
    pub boot_volume: Option<String>,

    #[serde(default)]
    pub data_volumes: Vec<String>,

    /// 要接入的虚拟网络 id
    #[serde(default)]
    pub networks: Vec<String>,
}

/// 按 (主机名, 集群名) 定位虚拟机；`host_names` 为空表示集群内全部虚拟机
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRef {
    pub cluster_name: String,
    #[serde(default)]
    pub host_names: Vec<String>,
}

impl ClusterRef {
    pub fn whole(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            host_names: Vec::new(),
        }
    }
}

impl From<&ClusterConfig> for ClusterRef {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            cluster_name: config.cluster_name.clone(),
            host_names: config.vms.iter().map(|vm| vm.host_name.clone()).collect(),
        }
    }
}

/// 单台虚拟机的失败原因
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmFailure {
    pub host_name: String,
    pub server_id: Option<String>,
    pub error: String,
}

/// 集群操作结果，逐台记录
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterReport {
    pub cluster_name: String,
    /// 成功的虚拟机 id
    pub succeeded: Vec<String>,
    pub failed: Vec<VmFailure>,
    /// 已被虚拟机控制器认领、仍在创建中的虚拟机 id
    #[serde(default)]
    pub handed_off: Vec<String>,
    /// 请求中存在但集群里找不到的主机名
    pub missing: Vec<String>,
}

impl ClusterReport {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            ..Self::default()
        }
    }

    pub fn fail(&mut self, host_name: &str, server_id: Option<&str>, error: impl ToString) {
        self.failed.push(VmFailure {
            host_name: host_name.to_string(),
            server_id: server_id.map(str::to_string),
            error: error.to_string(),
        });
    }

    /// 没有失败和缺失，交由控制器继续创建的不算失败
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.missing.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(host_name: &str) -> VmConfig {
        VmConfig {
            host_name: host_name.to_string(),
            cpu: 2,
            memory_mb: 2048,
            public_ip: None,
            private_ip: None,
            boot_volume: None,
            data_volumes: Vec::new(),
            networks: Vec::new(),
        }
    }

    #[test]
    fn test_cluster_config_validation() {
        let ok = ClusterConfig {
            cluster_name: "web".to_string(),
            os_variant: "ubuntu22.04".to_string(),
            vms: vec![vm("web-1")],
        };
        assert!(ok.validate().is_ok());

        let empty = ClusterConfig { vms: Vec::new(), ..ok.clone() };
        assert!(empty.validate().is_err());

        let unnamed = ClusterConfig { cluster_name: String::new(), ..ok };
        assert!(unnamed.validate().is_err());

        assert!(VmConfig { cpu: 0, ..vm("x") }.validate().is_err());
    }

    #[test]
    fn test_cluster_ref_from_config() {
        let config = ClusterConfig {
            cluster_name: "db".to_string(),
            os_variant: "centos7".to_string(),
            vms: vec![vm("db-1"), vm("db-2")],
        };
        let target = ClusterRef::from(&config);
        assert_eq!(target.host_names, vec!["db-1", "db-2"]);
        assert!(ClusterRef::whole("db").host_names.is_empty());
    }
}
