/// IP 地址池模型

use serde::{Deserialize, Serialize};

/// 已登记的网段
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpNetwork {
    pub id: String,
    /// 规范化后的 CIDR（网络地址/前缀长度）
    pub cidr: String,
    /// 第一个可分配地址
    pub start: String,
    /// 最后一个可分配地址
    pub end: String,
}

/// 地址分配记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpAddressRecord {
    pub network_cidr: String,
    pub address: String,
    pub holder: String,
}
