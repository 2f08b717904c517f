/// 存储卷模型

use serde::{Deserialize, Serialize};

use super::ResourceMeta;

/// 存储卷状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VolumeStatus {
    Pending,
    Provisioning,
    Available,
    Deleting,
    Error,
}

impl VolumeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeStatus::Pending => "pending",
            VolumeStatus::Provisioning => "provisioning",
            VolumeStatus::Available => "available",
            VolumeStatus::Deleting => "deleting",
            VolumeStatus::Error => "error",
        }
    }
}

/// 存储后端类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VolumeBackendType {
    Lvm,
    DiskImage,
}

/// 启动盘或数据盘
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    Boot,
    Data,
}

/// 存储卷的物理位置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeLocation {
    Lvm { vg: String, lv: String },
    File { path: String },
}

/// 创建时的数据来源
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeSource {
    /// 从已有逻辑卷创建快照
    Snapshot { vg: String, lv: String },
    /// 复制已有磁盘镜像
    Image { path: String },
}

/// 存储卷记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub backend: VolumeBackendType,
    pub kind: VolumeKind,
    pub size_bytes: u64,
    pub location: VolumeLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<VolumeSource>,
    pub status: VolumeStatus,
    pub meta: ResourceMeta,
}
