/// IP 地址管理服务
///
/// 网段登记在 `ipnetworks/<id>`，每个已分配地址一条记录 `ipaddresses/<cidr>/<addr>`。
/// 网段的增删通过 `ipam` 锁串行化，地址的分配释放通过 `ippool/<id>` 锁串行化。
/// 删除网段时在 `ipam` 锁内再持有 `ippool/<id>`，加锁顺序固定为先 `ipam` 后 `ippool`。

use common::models::{IpAddressRecord, IpNetwork};
use common::utils::generate_short_id;
use common::{keys, Error, Result};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, info};

use crate::app_state::AppState;
use crate::store::StateStore;

/// 解析后的网段，地址统一用 128 位整数表示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cidr {
    v6: bool,
    network: u128,
    prefix: u8,
}

impl Cidr {
    fn parse(cidr: &str) -> Result<Self> {
        let (addr, prefix) = cidr
            .trim()
            .split_once('/')
            .ok_or_else(|| Error::Validation(format!("无效的 CIDR 格式: {}", cidr)))?;

        let addr: IpAddr = addr
            .parse()
            .map_err(|_| Error::Validation(format!("无效的网络地址: {}", cidr)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| Error::Validation(format!("无效的前缀长度: {}", cidr)))?;

        let v6 = addr.is_ipv6();
        let bits = if v6 { 128 } else { 32 };
        if prefix > bits {
            return Err(Error::Validation(format!("前缀长度超出范围: {}", cidr)));
        }

        let value = to_u128(addr);
        let cidr = Self { v6, network: 0, prefix };
        Ok(Self {
            network: value & cidr.net_mask(),
            ..cidr
        })
    }

    fn bits(&self) -> u8 {
        if self.v6 {
            128
        } else {
            32
        }
    }

    fn full_mask(&self) -> u128 {
        if self.v6 {
            u128::MAX
        } else {
            u32::MAX as u128
        }
    }

    fn host_mask(&self) -> u128 {
        let host_bits = u32::from(self.bits() - self.prefix);
        if host_bits >= 128 {
            u128::MAX
        } else {
            ((1u128 << host_bits) - 1) & self.full_mask()
        }
    }

    fn net_mask(&self) -> u128 {
        self.full_mask() ^ self.host_mask()
    }

    fn broadcast(&self) -> u128 {
        self.network | self.host_mask()
    }

    /// 可分配范围：网络地址 + 1 到广播地址 - 2
    fn usable_range(&self) -> Option<(u128, u128)> {
        let start = self.network.checked_add(1)?;
        let end = self.broadcast().checked_sub(2)?;
        (start <= end).then_some((start, end))
    }

    fn overlaps(&self, other: &Cidr) -> bool {
        self.v6 == other.v6 && self.network <= other.broadcast() && other.network <= self.broadcast()
    }

    fn contains(&self, value: u128) -> bool {
        self.network <= value && value <= self.broadcast()
    }

    fn format(&self, value: u128) -> String {
        if self.v6 {
            Ipv6Addr::from(value).to_string()
        } else {
            Ipv4Addr::from(value as u32).to_string()
        }
    }

    fn canonical(&self) -> String {
        format!("{}/{}", self.format(self.network), self.prefix)
    }
}

fn to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// 前缀长度，用于拼接 `addr/prefix`
pub fn prefix_len(cidr: &str) -> Result<u8> {
    Ok(Cidr::parse(cidr)?.prefix)
}

pub struct IpamService {
    store: StateStore,
}

impl IpamService {
    pub fn new(state: &AppState) -> Self {
        Self {
            store: state.store(),
        }
    }

    /// 登记网段，与已有网段重叠时拒绝
    pub async fn create_ip_network(&self, cidr: &str) -> Result<IpNetwork> {
        let parsed = Cidr::parse(cidr)?;
        let (start, end) = parsed
            .usable_range()
            .ok_or_else(|| Error::Validation(format!("网段 {} 没有可分配地址", cidr)))?;

        self.store
            .with_lock(keys::locks::IPAM, move || async move {
                for existing in self.list_ip_networks().await? {
                    let other = Cidr::parse(&existing.cidr)?;
                    if parsed.overlaps(&other) {
                        return Err(Error::Validation(format!(
                            "网段 {} 与已有网段 {} 重叠",
                            parsed.canonical(),
                            existing.cidr
                        )));
                    }
                }

                let network = IpNetwork {
                    id: generate_short_id(),
                    cidr: parsed.canonical(),
                    start: parsed.format(start),
                    end: parsed.format(end),
                };
                self.store.create(&keys::ip_network(&network.id), &network).await?;

                info!("✅ 网段已登记: {} ({}), 可分配 {} - {}", network.cidr, network.id, network.start, network.end);
                Ok(network)
            })
            .await
    }

    pub async fn get_ip_network(&self, id: &str) -> Result<IpNetwork> {
        match self.store.find::<IpNetwork>(&keys::ip_network(id)).await? {
            Some(v) => Ok(v.value),
            None => Err(Error::NotFound(format!("网段 {} 不存在", id))),
        }
    }

    pub async fn list_ip_networks(&self) -> Result<Vec<IpNetwork>> {
        Ok(self
            .store
            .list::<IpNetwork>(keys::IP_NETWORKS)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    pub async fn list_allocations(&self, network_id: &str) -> Result<Vec<IpAddressRecord>> {
        let network = self.get_ip_network(network_id).await?;
        self.allocations(&network.cidr).await
    }

    async fn allocations(&self, cidr: &str) -> Result<Vec<IpAddressRecord>> {
        Ok(self
            .store
            .list::<IpAddressRecord>(&keys::ip_addresses(cidr))
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    /// 从起始地址开始顺序扫描，分配第一个空闲地址
    pub async fn allocate_ip(&self, network_id: &str, holder: &str) -> Result<String> {
        let network = self.get_ip_network(network_id).await?;
        let cidr = Cidr::parse(&network.cidr)?;
        let (start, end) = cidr
            .usable_range()
            .ok_or_else(|| Error::Internal(format!("网段 {} 范围异常", network.cidr)))?;

        self.store
            .with_lock(&keys::locks::ip_pool(network_id), move || async move {
                // 等锁期间网段可能已被删除
                if self.store.find::<IpNetwork>(&keys::ip_network(network_id)).await?.is_none() {
                    return Err(Error::NotFound(format!("网段 {} 不存在", network_id)));
                }

                let taken: HashSet<String> = self
                    .allocations(&network.cidr)
                    .await?
                    .into_iter()
                    .map(|r| r.address)
                    .collect();

                let mut candidate = start;
                loop {
                    let address = cidr.format(candidate);
                    if !taken.contains(&address) {
                        let record = IpAddressRecord {
                            network_cidr: network.cidr.clone(),
                            address: address.clone(),
                            holder: holder.to_string(),
                        };
                        match self
                            .store
                            .create(&keys::ip_address(&network.cidr, &address), &record)
                            .await
                        {
                            Ok(_) => {
                                debug!("分配地址 {} 给 {}", address, holder);
                                return Ok(address);
                            }
                            Err(Error::UpdateConflict(_)) => {}
                            Err(e) => return Err(e),
                        }
                    }

                    if candidate >= end {
                        break;
                    }
                    candidate += 1;
                }

                Err(Error::ResourceExhausted(format!("网段 {} 已无可用地址", network.cidr)))
            })
            .await
    }

    /// 释放地址，地址未分配时返回 NotFound
    pub async fn release_ip(&self, network_id: &str, address: &str) -> Result<()> {
        let network = self.get_ip_network(network_id).await?;
        let cidr = Cidr::parse(&network.cidr)?;
        let parsed: IpAddr = address
            .parse()
            .map_err(|_| Error::Validation(format!("无效的 IP 地址: {}", address)))?;
        let value = to_u128(parsed);
        if parsed.is_ipv6() != cidr.v6 || !cidr.contains(value) {
            return Err(Error::Validation(format!("地址 {} 不属于网段 {}", address, network.cidr)));
        }
        let key = keys::ip_address(&network.cidr, &cidr.format(value));

        self.store
            .with_lock(&keys::locks::ip_pool(network_id), move || async move {
                if self.store.find::<IpAddressRecord>(&key).await?.is_none() {
                    return Err(Error::NotFound(format!("地址 {} 未分配", address)));
                }
                self.store.delete(&key).await?;
                debug!("释放地址 {}", address);
                Ok(())
            })
            .await
    }

    /// 删除网段，仍有地址被占用时拒绝
    pub async fn delete_ip_network_by_id(&self, id: &str) -> Result<()> {
        self.store
            .with_lock(keys::locks::IPAM, move || async move {
                self.store
                    .with_lock(&keys::locks::ip_pool(id), move || async move {
                        let network = self.get_ip_network(id).await?;
                        let in_use = self.allocations(&network.cidr).await?.len();
                        if in_use > 0 {
                            return Err(Error::Validation(format!(
                                "网段 {} 仍有 {} 个地址被占用",
                                network.cidr, in_use
                            )));
                        }
                        self.store.delete(&keys::ip_network(id)).await?;
                        info!("🗑️ 网段已删除: {} ({})", network.cidr, id);
                        Ok(())
                    })
                    .await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;

    #[test]
    fn test_cidr_normalises_to_network_address() {
        let cidr = Cidr::parse("192.168.200.77/24").unwrap();
        assert_eq!(cidr.canonical(), "192.168.200.0/24");
        let (start, end) = cidr.usable_range().unwrap();
        assert_eq!(cidr.format(start), "192.168.200.1");
        assert_eq!(cidr.format(end), "192.168.200.253");

        let v6 = Cidr::parse("fd00::1234/120").unwrap();
        assert_eq!(v6.canonical(), "fd00::1200/120");

        assert!(Cidr::parse("10.0.0.0/33").is_err());
        assert!(Cidr::parse("10.0.0.0").is_err());
        assert!(Cidr::parse("10.0.0.0/32").unwrap().usable_range().is_none());
    }

    #[tokio::test]
    async fn test_allocate_release_allocate_returns_same_address() {
        let harness = Harness::new();
        let ipam = IpamService::new(&harness.state);
        let network = ipam.create_ip_network("10.1.0.0/24").await.unwrap();

        let first = ipam.allocate_ip(&network.id, "host1").await.unwrap();
        ipam.release_ip(&network.id, &first).await.unwrap();
        let second = ipam.allocate_ip(&network.id, "host1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "10.1.0.1");
    }

    #[tokio::test]
    async fn test_slash_24_exhausts_after_253_hosts() {
        let harness = Harness::new();
        let ipam = IpamService::new(&harness.state);
        let network = ipam.create_ip_network("192.168.200.0/24").await.unwrap();

        let mut seen = HashSet::new();
        for host in 2..=254 {
            let addr = ipam
                .allocate_ip(&network.id, &format!("host{}", host))
                .await
                .unwrap();
            assert!(seen.insert(addr));
        }
        assert_eq!(seen.len(), 253);
        assert!(!seen.contains("192.168.200.254"));

        let err = ipam.allocate_ip(&network.id, "host255").await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_overlapping_networks_are_rejected() {
        let harness = Harness::new();
        let ipam = IpamService::new(&harness.state);
        ipam.create_ip_network("192.168.200.0/24").await.unwrap();

        let duplicate = ipam.create_ip_network("192.168.200.0/24").await.unwrap_err();
        assert!(matches!(duplicate, Error::Validation(_)));

        let nested = ipam.create_ip_network("192.168.200.0/25").await.unwrap_err();
        assert!(matches!(nested, Error::Validation(_)));

        ipam.create_ip_network("192.168.201.0/24").await.unwrap();
        assert_eq!(ipam.list_ip_networks().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_guarded_while_addresses_allocated() {
        let harness = Harness::new();
        let ipam = IpamService::new(&harness.state);
        let network = ipam.create_ip_network("172.16.0.0/28").await.unwrap();

        let addr = ipam.allocate_ip(&network.id, "vm-00001").await.unwrap();
        let err = ipam.delete_ip_network_by_id(&network.id).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        ipam.release_ip(&network.id, &addr).await.unwrap();
        ipam.delete_ip_network_by_id(&network.id).await.unwrap();
        assert!(ipam.get_ip_network(&network.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_allocation_waiting_on_deleted_network_leaves_no_record() {
        let harness = Harness::new();
        let ipam = IpamService::new(&harness.state);
        let network = ipam.create_ip_network("10.50.0.0/24").await.unwrap();

        let pool_lock = harness
            .store()
            .lock(&keys::locks::ip_pool(&network.id))
            .await
            .unwrap();

        let delete = {
            let state = harness.state.clone();
            let id = network.id.clone();
            tokio::spawn(async move { IpamService::new(&state).delete_ip_network_by_id(&id).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let allocate = {
            let state = harness.state.clone();
            let id = network.id.clone();
            tokio::spawn(async move { IpamService::new(&state).allocate_ip(&id, "vm-00001").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        // 删除和分配都在等同一把地址池锁，删除先排队
        assert!(!delete.is_finished());
        assert!(!allocate.is_finished());
        pool_lock.release().await.unwrap();

        delete.await.unwrap().unwrap();
        assert!(allocate.await.unwrap().unwrap_err().is_not_found());
        assert!(ipam.get_ip_network(&network.id).await.unwrap_err().is_not_found());
        assert!(harness
            .store()
            .list::<IpAddressRecord>(&keys::ip_addresses(&network.cidr))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_delete_waits_for_pending_allocation() {
        let harness = Harness::new();
        let ipam = IpamService::new(&harness.state);
        let network = ipam.create_ip_network("10.51.0.0/24").await.unwrap();

        let pool_lock = harness
            .store()
            .lock(&keys::locks::ip_pool(&network.id))
            .await
            .unwrap();

        let allocate = {
            let state = harness.state.clone();
            let id = network.id.clone();
            tokio::spawn(async move { IpamService::new(&state).allocate_ip(&id, "vm-00001").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let delete = {
            let state = harness.state.clone();
            let id = network.id.clone();
            tokio::spawn(async move { IpamService::new(&state).delete_ip_network_by_id(&id).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        pool_lock.release().await.unwrap();

        assert_eq!(allocate.await.unwrap().unwrap(), "10.51.0.1");
        assert!(matches!(delete.await.unwrap().unwrap_err(), Error::Validation(_)));
        assert_eq!(ipam.list_allocations(&network.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_release_unallocated_address_is_not_found() {
        let harness = Harness::new();
        let ipam = IpamService::new(&harness.state);
        let network = ipam.create_ip_network("10.2.0.0/24").await.unwrap();

        assert!(ipam.release_ip(&network.id, "10.2.0.9").await.unwrap_err().is_not_found());
        assert!(matches!(
            ipam.release_ip(&network.id, "10.3.0.9").await.unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_distinct() {
        let harness = Harness::new();
        let network = IpamService::new(&harness.state)
            .create_ip_network("10.9.0.0/24")
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let state = harness.state.clone();
            let id = network.id.clone();
            handles.push(tokio::spawn(async move {
                IpamService::new(&state).allocate_ip(&id, &format!("h{}", i)).await
            }));
        }

        let mut seen = HashSet::new();
        for handle in futures::future::join_all(handles).await {
            assert!(seen.insert(handle.unwrap().unwrap()));
        }
        assert_eq!(seen.len(), 10);
        assert_eq!(
            IpamService::new(&harness.state)
                .list_allocations(&network.id)
                .await
                .unwrap()
                .len(),
            10
        );
    }
}
