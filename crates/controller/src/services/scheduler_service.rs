/// 资源调度服务
///
/// 在 ACTIVE 宿主机中选择剩余 CPU 最多且满足请求的一台，通过 CAS 扣减容量，
/// 然后生成虚拟机 id 并以 INITIALIZING 状态写入虚拟机记录。

use common::models::{Hypervisor, HypervisorStatus, NetworkAttachment, ResourceMeta, Server, ServerStatus};
use common::utils::sequence_name;
use common::{keys, Error, Result};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::dto::NewServer;
use crate::store::{StateStore, Versioned};

/// 扣减容量遇到冲突时重新选择的次数
const MAX_PLACEMENT_ATTEMPTS: usize = 5;

const SERVER_SEQUENCE: &str = "server";

/// 候选宿主机中剩余 CPU 最多且容量足够的一台；剩余 CPU 相同时保持列表顺序
pub fn select_hypervisor(
    candidates: &[Versioned<Hypervisor>],
    cpu: u32,
    memory_mb: u64,
) -> Option<&Versioned<Hypervisor>> {
    let mut active: Vec<&Versioned<Hypervisor>> = candidates
        .iter()
        .filter(|hv| hv.value.status == HypervisorStatus::Active)
        .collect();
    active.sort_by(|a, b| b.value.free_cpu.cmp(&a.value.free_cpu));
    active.into_iter().find(|hv| hv.value.fits(cpu, memory_mb))
}

pub struct SchedulerService {
    store: StateStore,
}

impl SchedulerService {
    pub fn new(state: &AppState) -> Self {
        Self {
            store: state.store(),
        }
    }

    /// 选择宿主机并扣减容量，返回扣减后的宿主机
    async fn reserve(&self, cpu: u32, memory_mb: u64) -> Result<Hypervisor> {
        for attempt in 1..=MAX_PLACEMENT_ATTEMPTS {
            let hypervisors = self.store.list::<Hypervisor>(keys::HYPERVISORS).await?;
            let chosen = select_hypervisor(&hypervisors, cpu, memory_mb).ok_or_else(|| {
                Error::ResourceExhausted(format!(
                    "没有可容纳 {} 核 CPU、{}MB 内存的宿主机",
                    cpu, memory_mb
                ))
            })?;

            let mut debited = chosen.value.clone();
            if !debited.debit(cpu, memory_mb) {
                return Err(Error::Internal(format!("宿主机 {} 容量扣减失败", debited.node)));
            }

            match self.store.put_cas(&chosen.key, chosen.revision, &debited).await {
                Ok(_) => return Ok(debited),
                Err(Error::UpdateConflict(_)) => {
                    debug!("宿主机 {} 容量已被修改，第 {} 次重新选择", debited.node, attempt);
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::UpdateConflict(format!(
            "连续 {} 次扣减宿主机容量冲突",
            MAX_PLACEMENT_ATTEMPTS
        )))
    }

    /// 调度一台虚拟机并写入 INITIALIZING 记录
    pub async fn schedule(&self, request: NewServer) -> Result<Versioned<Server>> {
        let hypervisor = self.reserve(request.cpu, request.memory_mb).await?;

        match self.persist(&hypervisor, &request).await {
            Ok(server) => {
                info!(
                    "📍 虚拟机 {} ({}/{}) 调度到宿主机 {}，剩余 CPU {}，剩余内存 {}MB",
                    server.value.id,
                    request.cluster_name,
                    request.host_name,
                    hypervisor.node,
                    hypervisor.free_cpu,
                    hypervisor.free_memory_mb
                );
                Ok(server)
            }
            Err(e) => {
                // 记录没写成功，归还已扣减的容量
                if let Err(release_err) = self.release(&hypervisor.node, request.cpu, request.memory_mb).await {
                    warn!("归还宿主机 {} 容量失败: {}", hypervisor.node, release_err);
                }
                Err(e)
            }
        }
    }

    async fn persist(&self, hypervisor: &Hypervisor, request: &NewServer) -> Result<Versioned<Server>> {
        let id = sequence_name("vm", self.store.next_sequence(SERVER_SEQUENCE).await?);
        let server = Server {
            id: id.clone(),
            host_name: request.host_name.clone(),
            cluster_name: request.cluster_name.clone(),
            cpu: request.cpu,
            memory_mb: request.memory_mb,
            placement: Some(hypervisor.placement()),
            boot_volume: request.boot_volume.clone(),
            data_volumes: request.data_volumes.clone(),
            networks: request
                .networks
                .iter()
                .map(|network_id| NetworkAttachment {
                    network_id: network_id.clone(),
                    address: None,
                })
                .collect(),
            public_ip: request.public_ip.clone(),
            private_ip: request.private_ip.clone(),
            os_variant: request.os_variant.clone(),
            status: ServerStatus::Initializing,
            meta: ResourceMeta::new(),
        };

        let key = keys::server(&id);
        let revision = self.store.create(&key, &server).await?;
        Ok(Versioned {
            key,
            revision,
            value: server,
        })
    }

    /// 归还宿主机容量
    pub async fn release(&self, node: &str, cpu: u32, memory_mb: u64) -> Result<()> {
        self.store
            .update::<Hypervisor, _>(&keys::hypervisor(node), |hv| {
                hv.credit(cpu, memory_mb);
                Ok(())
            })
            .await?;
        debug!("宿主机 {} 归还 {} 核 CPU、{}MB 内存", node, cpu, memory_mb);
        Ok(())
    }
}
