/// 宿主机（Hypervisor）与系统模板模型

use serde::{Deserialize, Serialize};

/// 宿主机状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorStatus {
    Inactive,
    Active,
    Error,
}

impl HypervisorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HypervisorStatus::Inactive => "inactive",
            HypervisorStatus::Active => "active",
            HypervisorStatus::Error => "error",
        }
    }
}

/// 宿主机上的存储池（LVM 卷组）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoragePool {
    pub vg_name: String,
    pub capacity: u64,
    pub free_capacity: u64,
    pub pool_type: String,
}

/// 宿主机记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hypervisor {
    pub node: String,
    pub cpu: u32,
    pub free_cpu: u32,
    pub memory_mb: u64,
    pub free_memory_mb: u64,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub storage_pools: Vec<StoragePool>,
    pub status: HypervisorStatus,
}

impl Hypervisor {
    /// 剩余容量是否满足请求
    pub fn fits(&self, cpu: u32, memory_mb: u64) -> bool {
        self.free_cpu >= cpu && self.free_memory_mb >= memory_mb
    }

    /// 扣减容量，不足时返回 false 且不做修改
    pub fn debit(&mut self, cpu: u32, memory_mb: u64) -> bool {
        if !self.fits(cpu, memory_mb) {
            return false;
        }
        self.free_cpu -= cpu;
        self.free_memory_mb -= memory_mb;
        true
    }

    /// 归还容量，不超过总量
    pub fn credit(&mut self, cpu: u32, memory_mb: u64) {
        self.free_cpu = self.free_cpu.saturating_add(cpu).min(self.cpu);
        self.free_memory_mb = self.free_memory_mb.saturating_add(memory_mb).min(self.memory_mb);
    }

    pub fn placement(&self) -> Placement {
        Placement {
            node: self.node.clone(),
            ip: self.ip.clone(),
            port: self.port,
        }
    }
}

/// 虚拟机所在宿主机
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Placement {
    pub node: String,
    pub ip: String,
    pub port: u16,
}

/// 系统模板镜像，按操作系统变体索引
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OsTemplate {
    pub variant: String,
    pub vg: String,
    pub lv: String,
    pub size_bytes: u64,
}
