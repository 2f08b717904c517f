/// 虚拟网络管理服务

use chrono::Utc;
use common::models::{NetworkMetadata, NetworkSpec, NetworkStatus, ResourceMeta, Server, VirtualNetwork};
use common::utils::sequence_name;
use common::{keys, Error, Result};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::app_state::AppState;
use crate::dto::{validation_error, NetworkRequest};
use crate::services::ipam_service::IpamService;
use crate::store::StateStore;

const NETWORK_SEQUENCE: &str = "network";

pub struct NetworkService {
    store: StateStore,
    ipam: IpamService,
}

impl NetworkService {
    pub fn new(state: &AppState) -> Self {
        Self {
            store: state.store(),
            ipam: IpamService::new(state),
        }
    }

    /// 创建虚拟网络，记录以 PENDING 状态写入，由网络控制器部署
    pub async fn create_virtual_network(&self, request: NetworkRequest) -> Result<VirtualNetwork> {
        request.validate().map_err(validation_error)?;
        if let Some(pool) = &request.ip_pool_id {
            self.ipam.get_ip_network(pool).await?;
        }

        let existing = self.list_virtual_networks().await?;
        if let Some(other) = existing.iter().find(|n| n.spec.bridge == request.bridge) {
            return Err(Error::Validation(format!(
                "Bridge {} 已被虚拟网络 {} 使用",
                request.bridge, other.id
            )));
        }

        let id = sequence_name("net", self.store.next_sequence(NETWORK_SEQUENCE).await?);
        let network = VirtualNetwork {
            id: id.clone(),
            metadata: NetworkMetadata {
                name: request.name,
                uuid: Uuid::new_v4().to_string(),
            },
            spec: NetworkSpec {
                bridge: request.bridge,
                ip_pool_id: request.ip_pool_id,
                forward_mode: request.forward_mode,
            },
            gateway: None,
            status: NetworkStatus::Pending,
            meta: ResourceMeta::new(),
        };

        self.store.create(&keys::network(&id), &network).await?;
        info!("✅ 虚拟网络已提交: {} ({})", network.metadata.name, id);
        Ok(network)
    }

    /// 标记删除；仍有虚拟机接入时拒绝
    pub async fn delete_virtual_network_by_id(&self, id: &str) -> Result<VirtualNetwork> {
        let servers = self.store.list::<Server>(keys::SERVERS).await?;
        if let Some(attached) = servers
            .iter()
            .find(|s| s.value.networks.iter().any(|a| a.network_id == id))
        {
            return Err(Error::Validation(format!(
                "虚拟网络 {} 仍有虚拟机 {} 接入",
                id, attached.value.id
            )));
        }

        let updated = self
            .store
            .update::<VirtualNetwork, _>(&keys::network(id), |n| {
                if n.meta.mark_for_deletion(Utc::now()) {
                    n.meta.touch();
                }
                Ok(())
            })
            .await?;
        info!("虚拟网络 {} 已标记删除", id);
        Ok(updated.value)
    }

    pub async fn get_virtual_network(&self, id: &str) -> Result<VirtualNetwork> {
        match self.store.find::<VirtualNetwork>(&keys::network(id)).await? {
            Some(v) => Ok(v.value),
            None => Err(Error::NotFound(format!("虚拟网络 {} 不存在", id))),
        }
    }

    pub async fn list_virtual_networks(&self) -> Result<Vec<VirtualNetwork>> {
        Ok(self
            .store
            .list::<VirtualNetwork>(keys::NETWORKS)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }
}
