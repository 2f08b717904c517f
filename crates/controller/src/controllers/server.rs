/// 虚拟机控制器
///
/// 创建时为每个网络接入分配地址并向所在宿主机的 Agent 下发 CreateVM；
/// 删除时下发 DestroyVM，归还宿主机容量和网络地址。

use async_trait::async_trait;
use common::models::agent::{AgentResponse, DiskSpec, NetworkInterfaceSpec, TemplateDisk, VmSpec};
use common::models::{
    OsTemplate, Placement, ResourceMeta, Server, ServerStatus, VirtualNetwork, Volume, VolumeLocation,
};
use common::{keys, Error, Result};
use std::sync::Arc;
use tracing::{info, warn};

use super::{LifecycleHandler, Phase, Reconcilable};
use crate::app_state::AppState;
use crate::backends::AgentClient;
use crate::services::ipam_service::IpamService;
use crate::services::scheduler_service::SchedulerService;
use crate::store::StateStore;

impl Reconcilable for Server {
    const KIND: &'static str = "server";
    const PREFIX: &'static str = keys::SERVERS;

    fn id(&self) -> &str {
        &self.id
    }

    fn phase(&self) -> Phase {
        match self.status {
            ServerStatus::Initializing => Phase::Pending,
            ServerStatus::Provisioning => Phase::Provisioning,
            ServerStatus::Running => Phase::Ready,
            ServerStatus::Stopped => Phase::Idle,
            ServerStatus::Deleting => Phase::Deleting,
            ServerStatus::Error => Phase::Error,
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        self.status = match phase {
            Phase::Pending => ServerStatus::Initializing,
            Phase::Provisioning => ServerStatus::Provisioning,
            Phase::Ready => ServerStatus::Running,
            Phase::Idle => ServerStatus::Stopped,
            Phase::Deleting => ServerStatus::Deleting,
            Phase::Error => ServerStatus::Error,
        };
    }

    fn status_str(&self) -> &'static str {
        self.status.as_str()
    }

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ResourceMeta {
        &mut self.meta
    }
}

/// 存储卷在宿主机上的设备路径
fn volume_path(volume: &Volume) -> String {
    match &volume.location {
        VolumeLocation::Lvm { vg, lv } => format!("/dev/{}/{}", vg, lv),
        VolumeLocation::File { path } => path.clone(),
    }
}

fn placement_of(server: &Server) -> Result<&Placement> {
    server
        .placement
        .as_ref()
        .ok_or_else(|| Error::StateTransition(format!("虚拟机 {} 尚未调度", server.id)))
}

fn ensure_success(response: AgentResponse, op: &str, server: &Server) -> Result<()> {
    if response.is_success() {
        return Ok(());
    }
    Err(Error::Backend(format!(
        "{} 虚拟机 {} 失败: code={}, {}",
        op, server.id, response.code, response.message
    )))
}

/// 只含身份信息的描述，用于启动、停止和销毁
pub fn identity_spec(server: &Server) -> VmSpec {
    VmSpec {
        vm_id: server.id.clone(),
        host_name: server.host_name.clone(),
        cluster_name: server.cluster_name.clone(),
        vcpu: server.cpu,
        memory_mb: server.memory_mb,
        template: None,
        disks: Vec::new(),
        networks: Vec::new(),
        public_ip: server.public_ip.clone(),
        private_ip: server.private_ip.clone(),
    }
}

pub struct ServerLifecycle {
    store: StateStore,
    agent: Arc<dyn AgentClient>,
    scheduler: SchedulerService,
    ipam: IpamService,
}

impl ServerLifecycle {
    pub fn new(state: &AppState) -> Self {
        Self {
            store: state.store(),
            agent: state.agent.clone(),
            scheduler: SchedulerService::new(state),
            ipam: IpamService::new(state),
        }
    }

    async fn network(&self, id: &str) -> Result<VirtualNetwork> {
        match self.store.find::<VirtualNetwork>(&keys::network(id)).await? {
            Some(v) => Ok(v.value),
            None => Err(Error::NotFound(format!("虚拟网络 {} 不存在", id))),
        }
    }

    /// 创建用的完整描述：系统模板、磁盘和网卡
    pub async fn full_spec(&self, server: &Server) -> Result<VmSpec> {
        let template = match self.store.find::<OsTemplate>(&keys::image(&server.os_variant)).await? {
            Some(v) => v.value,
            None => return Err(Error::NotFound(format!("系统模板 {} 不存在", server.os_variant))),
        };

        let mut disks = Vec::new();
        let volume_ids = server
            .boot_volume
            .iter()
            .map(|id| (id, true))
            .chain(server.data_volumes.iter().map(|id| (id, false)));
        for (volume_id, bootable) in volume_ids {
            let volume = self.store.get::<Volume>(&keys::volume(volume_id)).await?.value;
            disks.push(DiskSpec {
                volume_id: volume.id.clone(),
                bootable,
                volume_path: volume_path(&volume),
            });
        }

        let mut networks = Vec::new();
        for attachment in &server.networks {
            let network = self.network(&attachment.network_id).await?;
            networks.push(NetworkInterfaceSpec {
                network_id: network.id,
                bridge_name: network.spec.bridge,
                ip_address: attachment.address.clone(),
            });
        }

        Ok(VmSpec {
            template: Some(TemplateDisk {
                os_variant: template.variant,
                vg: template.vg,
                lv: template.lv,
            }),
            disks,
            networks,
            ..identity_spec(server)
        })
    }

    /// 为尚未分配地址的网络接入分配地址，返回本次分配的 (地址池, 地址)
    async fn attach_addresses(&self, server: &mut Server) -> Result<Vec<(String, String)>> {
        let mut allocated = Vec::new();
        let server_id = server.id.clone();

        for attachment in server.networks.iter_mut().filter(|a| a.address.is_none()) {
            let pool = match self.network(&attachment.network_id).await {
                Ok(network) => network.spec.ip_pool_id,
                Err(e) => {
                    self.release_addresses(&allocated).await;
                    return Err(e);
                }
            };
            let Some(pool) = pool else { continue };

            match self.ipam.allocate_ip(&pool, &server_id).await {
                Ok(address) => {
                    attachment.address = Some(address.clone());
                    allocated.push((pool, address));
                }
                Err(e) => {
                    self.release_addresses(&allocated).await;
                    return Err(e);
                }
            }
        }

        Ok(allocated)
    }

    async fn release_addresses(&self, addresses: &[(String, String)]) {
        for (pool, address) in addresses {
            match self.ipam.release_ip(pool, address).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => warn!("归还地址 {} 失败: {}", address, e),
            }
        }
    }

    /// 已分配给虚拟机的全部地址
    async fn attached_addresses(&self, server: &Server) -> Vec<(String, String)> {
        let mut addresses = Vec::new();
        for attachment in &server.networks {
            let Some(address) = &attachment.address else { continue };
            match self.network(&attachment.network_id).await {
                Ok(network) => {
                    if let Some(pool) = network.spec.ip_pool_id {
                        addresses.push((pool, address.clone()));
                    }
                }
                Err(e) => warn!("虚拟机 {} 的地址 {} 无法归还: {}", server.id, address, e),
            }
        }
        addresses
    }

    pub async fn start(&self, server: &Server) -> Result<()> {
        let response = self.agent.start_vm(placement_of(server)?, &identity_spec(server)).await?;
        ensure_success(response, "启动", server)
    }

    pub async fn stop(&self, server: &Server) -> Result<()> {
        let response = self.agent.stop_vm(placement_of(server)?, &identity_spec(server)).await?;
        ensure_success(response, "停止", server)
    }
}

#[async_trait]
impl LifecycleHandler<Server> for ServerLifecycle {
    async fn create(&self, server: &mut Server) -> Result<()> {
        let target = placement_of(server)?.clone();
        let allocated = self.attach_addresses(server).await?;

        let result = async {
            let spec = self.full_spec(server).await?;
            let response = self.agent.create_vm(&target, &spec).await?;
            ensure_success(response, "创建", server)
        }
        .await;

        if let Err(e) = result {
            self.release_addresses(&allocated).await;
            return Err(e);
        }

        info!("🖥️ 虚拟机 {} ({}/{}) 已在宿主机 {} 上创建", server.id, server.cluster_name, server.host_name, target.node);
        Ok(())
    }

    async fn delete(&self, server: &Server) -> Result<()> {
        if let Some(target) = &server.placement {
            let response = self.agent.destroy_vm(target, &identity_spec(server)).await?;
            ensure_success(response, "销毁", server)?;

            match self.scheduler.release(&target.node, server.cpu, server.memory_mb).await {
                Ok(()) => {}
                Err(Error::NotFound(_)) => warn!("宿主机 {} 已不存在，跳过归还容量", target.node),
                Err(e) => return Err(e),
            }
        }

        let addresses = self.attached_addresses(server).await;
        self.release_addresses(&addresses).await;

        info!("虚拟机 {} 已销毁", server.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::{ReconcileSettings, Reconciler};
    use crate::metrics::ReconcilerMetrics;
    use crate::testing::Harness;
    use chrono::{Duration as ChronoDuration, Utc};
    use common::models::{
        ForwardMode, Hypervisor, HypervisorStatus, NetworkAttachment, NetworkMetadata, NetworkSpec,
        NetworkStatus,
    };
    use std::time::Duration;

    async fn seed(harness: &Harness) -> String {
        harness.add_hypervisor("node1", 8, 16384, HypervisorStatus::Active).await;
        harness.add_template("ubuntu22.04").await;

        let pool = IpamService::new(&harness.state)
            .create_ip_network("10.20.0.0/24")
            .await
            .unwrap();
        let network = VirtualNetwork {
            id: "net-00001".to_string(),
            metadata: NetworkMetadata {
                name: "default".to_string(),
                uuid: uuid::Uuid::new_v4().to_string(),
            },
            spec: NetworkSpec {
                bridge: "br0".to_string(),
                ip_pool_id: Some(pool.id.clone()),
                forward_mode: ForwardMode::Bridge,
            },
            gateway: None,
            status: NetworkStatus::Active,
            meta: ResourceMeta::new(),
        };
        harness.store().put(&keys::network(&network.id), &network).await.unwrap();
        pool.id
    }

    async fn schedule(harness: &Harness, host_name: &str) -> Server {
        SchedulerService::new(&harness.state)
            .schedule(crate::dto::NewServer {
                host_name: host_name.to_string(),
                cluster_name: "c1".to_string(),
                cpu: 2,
                memory_mb: 4096,
                os_variant: "ubuntu22.04".to_string(),
                boot_volume: None,
                data_volumes: Vec::new(),
                networks: vec!["net-00001".to_string()],
                public_ip: None,
                private_ip: None,
            })
            .await
            .unwrap()
            .value
    }

    fn reconciler(harness: &Harness) -> Reconciler<Server, ServerLifecycle> {
        Reconciler::new(
            harness.store().clone(),
            Arc::new(ServerLifecycle::new(&harness.state)),
            ReconcileSettings {
                interval: Duration::from_millis(10),
                grace_period: Duration::from_secs(10),
                provisioning_timeout: Duration::from_secs(600),
            },
            ReconcilerMetrics::unregistered("server").unwrap(),
        )
    }

    async fn stored(harness: &Harness, id: &str) -> Option<Server> {
        harness
            .store()
            .find::<Server>(&keys::server(id))
            .await
            .unwrap()
            .map(|v| v.value)
    }

    #[tokio::test]
    async fn test_initializing_server_is_created_and_running() {
        let harness = Harness::new();
        seed(&harness).await;
        let server = schedule(&harness, "web-1").await;

        reconciler(&harness).reconcile_once().await.unwrap();

        let running = stored(&harness, &server.id).await.unwrap();
        assert_eq!(running.status, ServerStatus::Running);
        assert_eq!(
            running.networks,
            vec![NetworkAttachment {
                network_id: "net-00001".to_string(),
                address: Some("10.20.0.1".to_string()),
            }]
        );
        assert_eq!(harness.agent.calls(), vec![("create".to_string(), server.id.clone())]);
    }

    #[tokio::test]
    async fn test_failed_create_releases_addresses() {
        let harness = Harness::new();
        let pool = seed(&harness).await;
        harness.agent.fail_on("create");
        let server = schedule(&harness, "web-1").await;

        reconciler(&harness).reconcile_once().await.unwrap();

        let failed = stored(&harness, &server.id).await.unwrap();
        assert_eq!(failed.status, ServerStatus::Error);
        assert!(failed.meta.last_error.unwrap().contains("code=500"));
        assert!(IpamService::new(&harness.state)
            .list_allocations(&pool)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_missing_template_is_error() {
        let harness = Harness::new();
        seed(&harness).await;
        harness.store().delete(&keys::image("ubuntu22.04")).await.unwrap();
        let server = schedule(&harness, "web-1").await;

        reconciler(&harness).reconcile_once().await.unwrap();
        assert_eq!(stored(&harness, &server.id).await.unwrap().status, ServerStatus::Error);
        assert!(harness.agent.calls().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_server_returns_capacity_and_addresses() {
        let harness = Harness::new();
        let pool = seed(&harness).await;
        let server = schedule(&harness, "web-1").await;

        let reconciler = reconciler(&harness);
        reconciler.reconcile_once().await.unwrap();

        harness
            .store()
            .update::<Server, _>(&keys::server(&server.id), |s| {
                s.meta.mark_for_deletion(Utc::now() - ChronoDuration::seconds(11));
                Ok(())
            })
            .await
            .unwrap();

        reconciler.reconcile_once().await.unwrap();
        assert_eq!(stored(&harness, &server.id).await.unwrap().status, ServerStatus::Deleting);

        reconciler.reconcile_once().await.unwrap();
        assert!(stored(&harness, &server.id).await.is_none());
        assert_eq!(harness.agent.count("destroy"), 1);

        let node = harness
            .store()
            .get::<Hypervisor>(&keys::hypervisor("node1"))
            .await
            .unwrap();
        assert_eq!((node.value.free_cpu, node.value.free_memory_mb), (8, 16384));
        assert!(IpamService::new(&harness.state)
            .list_allocations(&pool)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_stopped_server_is_left_alone() {
        let harness = Harness::new();
        seed(&harness).await;
        let server = schedule(&harness, "web-1").await;
        harness
            .store()
            .update::<Server, _>(&keys::server(&server.id), |s| {
                s.status = ServerStatus::Stopped;
                Ok(())
            })
            .await
            .unwrap();

        reconciler(&harness).reconcile_once().await.unwrap();
        assert_eq!(stored(&harness, &server.id).await.unwrap().status, ServerStatus::Stopped);
        assert!(harness.agent.calls().is_empty());
    }
}
