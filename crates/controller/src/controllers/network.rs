/// 虚拟网络控制器
///
/// 部署前从关联的地址池分配网关地址，部署失败时归还；同一网络的变更通过
/// `network/<id>` 锁串行化。

use async_trait::async_trait;
use common::models::{NetworkStatus, ResourceMeta, VirtualNetwork};
use common::{keys, Error, Result};
use std::sync::Arc;
use tracing::{info, warn};

use super::{LifecycleHandler, Phase, Reconcilable};
use crate::app_state::AppState;
use crate::backends::NetworkBackend;
use crate::services::ipam_service::{prefix_len, IpamService};
use crate::store::StateStore;

impl Reconcilable for VirtualNetwork {
    const KIND: &'static str = "network";
    const PREFIX: &'static str = keys::NETWORKS;

    fn id(&self) -> &str {
        &self.id
    }

    fn phase(&self) -> Phase {
        match self.status {
            NetworkStatus::Pending => Phase::Pending,
            NetworkStatus::Provisioning => Phase::Provisioning,
            NetworkStatus::Active => Phase::Ready,
            NetworkStatus::Deleting => Phase::Deleting,
            NetworkStatus::Error => Phase::Error,
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        self.status = match phase {
            Phase::Pending => NetworkStatus::Pending,
            Phase::Provisioning => NetworkStatus::Provisioning,
            Phase::Ready | Phase::Idle => NetworkStatus::Active,
            Phase::Deleting => NetworkStatus::Deleting,
            Phase::Error => NetworkStatus::Error,
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

pub struct NetworkLifecycle {
    store: StateStore,
    ipam: IpamService,
    backend: Arc<dyn NetworkBackend>,
}

/// "10.0.0.1/24" -> "10.0.0.1"
fn gateway_address(gateway: &str) -> &str {
    gateway.split_once('/').map(|(addr, _)| addr).unwrap_or(gateway)
}

impl NetworkLifecycle {
    pub fn new(state: &AppState) -> Self {
        Self {
            store: state.store(),
            ipam: IpamService::new(state),
            backend: state.network_backend.clone(),
        }
    }

    async fn release_gateway(&self, network: &VirtualNetwork) {
        let (Some(pool), Some(gateway)) = (&network.spec.ip_pool_id, &network.gateway) else {
            return;
        };
        match self.ipam.release_ip(pool, gateway_address(gateway)).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => warn!("归还网络 {} 的网关地址 {} 失败: {}", network.id, gateway, e),
        }
    }

    async fn define_locked(&self, network: &mut VirtualNetwork) -> Result<()> {
        let mut allocated = false;
        let pending_pool = match network.gateway {
            None => network.spec.ip_pool_id.clone(),
            Some(_) => None,
        };
        if let Some(pool) = pending_pool {
            let ip_network = self.ipam.get_ip_network(&pool).await?;
            let address = self.ipam.allocate_ip(&pool, &network.id).await?;
            network.gateway = Some(format!("{}/{}", address, prefix_len(&ip_network.cidr)?));
            allocated = true;
        }

        if let Err(e) = self.backend.define(network).await {
            if allocated {
                self.release_gateway(network).await;
                network.gateway = None;
            }
            return Err(e);
        }

        info!(
            "虚拟网络 {} 已部署，Bridge: {}，网关: {}",
            network.metadata.name,
            network.spec.bridge,
            network.gateway.as_deref().unwrap_or("-")
        );
        Ok(())
    }

    async fn undefine_locked(&self, network: &VirtualNetwork) -> Result<()> {
        self.backend.undefine(network).await?;
        self.release_gateway(network).await;
        Ok(())
    }
}

#[async_trait]
impl LifecycleHandler<VirtualNetwork> for NetworkLifecycle {
    async fn create(&self, network: &mut VirtualNetwork) -> Result<()> {
        let lock = keys::locks::network(&network.id);
        self.store
            .with_lock(&lock, move || self.define_locked(network))
            .await
    }

    async fn delete(&self, network: &VirtualNetwork) -> Result<()> {
        let lock = keys::locks::network(&network.id);
        self.store
            .with_lock(&lock, move || self.undefine_locked(network))
            .await
    }
}
