/// 键空间定义
///
/// 所有键都是相对于命名空间的路径，由状态存储层统一加上命名空间前缀

pub const HYPERVISORS: &str = "hypervisors/";
pub const SERVERS: &str = "servers/";
pub const IMAGES: &str = "images/";
pub const VOLUMES: &str = "volumes/";
pub const SEQUENCES: &str = "sequences/";
pub const VERSION: &str = "version";
pub const NETWORKS: &str = "networks/";
pub const IP_NETWORKS: &str = "ipnetworks/";
pub const IP_ADDRESSES: &str = "ipaddresses/";

/// 分布式锁名称
pub mod locks {
    pub const IPAM: &str = "ipam";

    pub fn ip_pool(network_id: &str) -> String {
        format!("ippool/{}", network_id)
    }

    pub fn network(network_id: &str) -> String {
        format!("network/{}", network_id)
    }
}

pub fn hypervisor(node: &str) -> String {
    format!("{}{}", HYPERVISORS, node)
}

pub fn server(id: &str) -> String {
    format!("{}{}", SERVERS, id)
}

pub fn image(variant: &str) -> String {
    format!("{}{}", IMAGES, variant)
}

pub fn volume(id: &str) -> String {
    format!("{}{}", VOLUMES, id)
}

pub fn sequence(name: &str) -> String {
    format!("{}{}", SEQUENCES, name)
}

pub fn network(id: &str) -> String {
    format!("{}{}", NETWORKS, id)
}

pub fn ip_network(id: &str) -> String {
    format!("{}{}", IP_NETWORKS, id)
}

/// 某个网段下所有地址分配记录的前缀，CIDR 自带的 `/` 保留，末尾再补 `/` 避免前缀误匹配
pub fn ip_addresses(cidr: &str) -> String {
    format!("{}{}/", IP_ADDRESSES, cidr)
}

pub fn ip_address(cidr: &str, address: &str) -> String {
    format!("{}{}", ip_addresses(cidr), address)
}
