/// 宿主机与系统模板管理服务

use chrono::Utc;
use common::models::constants::SCHEMA_VERSION;
use common::models::{Hypervisor, HypervisorStatus, OsTemplate, VersionMarker};
use common::{keys, Error, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::backends::AgentClient;
use crate::store::StateStore;

pub struct FleetService {
    store: StateStore,
    agent: Arc<dyn AgentClient>,
}

impl FleetService {
    pub fn new(state: &AppState) -> Self {
        Self {
            store: state.store(),
            agent: state.agent.clone(),
        }
    }

    /// 登记或覆盖宿主机记录
    pub async fn register_hypervisor(&self, hypervisor: Hypervisor) -> Result<Hypervisor> {
        if hypervisor.node.is_empty() {
            return Err(Error::Validation("宿主机名称不能为空".to_string()));
        }
        if !common::utils::validate_ip_address(&hypervisor.ip) {
            return Err(Error::Validation(format!("无效的宿主机地址: {}", hypervisor.ip)));
        }
        if hypervisor.free_cpu > hypervisor.cpu || hypervisor.free_memory_mb > hypervisor.memory_mb {
            return Err(Error::Validation(format!(
                "宿主机 {} 的剩余容量超过总量",
                hypervisor.node
            )));
        }

        self.store.put(&keys::hypervisor(&hypervisor.node), &hypervisor).await?;
        info!(
            "✅ 宿主机已登记: {} ({}:{}), CPU {}/{}, 内存 {}/{}MB",
            hypervisor.node,
            hypervisor.ip,
            hypervisor.port,
            hypervisor.free_cpu,
            hypervisor.cpu,
            hypervisor.free_memory_mb,
            hypervisor.memory_mb
        );
        Ok(hypervisor)
    }

    pub async fn get_hypervisor(&self, node: &str) -> Result<Hypervisor> {
        match self.store.find::<Hypervisor>(&keys::hypervisor(node)).await? {
            Some(v) => Ok(v.value),
            None => Err(Error::NotFound(format!("宿主机 {} 不存在", node))),
        }
    }

    pub async fn set_hypervisor_status(&self, node: &str, status: HypervisorStatus) -> Result<Hypervisor> {
        let updated = self
            .store
            .update::<Hypervisor, _>(&keys::hypervisor(node), |hv| {
                hv.status = status;
                Ok(())
            })
            .await?;
        info!("宿主机 {} 状态更新为 {}", node, status.as_str());
        Ok(updated.value)
    }

    pub async fn list_hypervisors(&self) -> Result<Vec<Hypervisor>> {
        Ok(self
            .store
            .list::<Hypervisor>(keys::HYPERVISORS)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    /// 探测 Agent，可达则标记为 ACTIVE，否则标记为 ERROR
    pub async fn probe_hypervisor(&self, node: &str) -> Result<Hypervisor> {
        let hypervisor = self.get_hypervisor(node).await?;
        let target = hypervisor.placement();

        let status = match self.agent.ping(&target).await {
            Ok(()) => match self.agent.get_version(&target).await {
                Ok(version) => {
                    info!("宿主机 {} Agent 版本: {} ({})", node, version.version, version.hypervisor);
                    HypervisorStatus::Active
                }
                Err(e) => {
                    warn!("获取宿主机 {} Agent 版本失败: {}", node, e);
                    HypervisorStatus::Error
                }
            },
            Err(e) => {
                warn!("宿主机 {} 不可达: {}", node, e);
                HypervisorStatus::Error
            }
        };

        self.set_hypervisor_status(node, status).await
    }

    pub async fn register_os_template(&self, template: OsTemplate) -> Result<OsTemplate> {
        if template.variant.is_empty() || template.vg.is_empty() || template.lv.is_empty() {
            return Err(Error::Validation("系统模板的变体、卷组和逻辑卷不能为空".to_string()));
        }
        self.store.put(&keys::image(&template.variant), &template).await?;
        info!("✅ 系统模板已登记: {} -> {}/{}", template.variant, template.vg, template.lv);
        Ok(template)
    }

    pub async fn get_os_template(&self, variant: &str) -> Result<OsTemplate> {
        match self.store.find::<OsTemplate>(&keys::image(variant)).await? {
            Some(v) => Ok(v.value),
            None => Err(Error::NotFound(format!("系统模板 {} 不存在", variant))),
        }
    }

    /// 首次启动时写入键空间版本；已有版本比程序新时拒绝启动
    pub async fn ensure_version_marker(&self) -> Result<VersionMarker> {
        let marker = VersionMarker {
            schema_version: SCHEMA_VERSION,
            written_at: Utc::now(),
        };

        match self.store.create(keys::VERSION, &marker).await {
            Ok(_) => {
                info!("写入键空间版本 {}", SCHEMA_VERSION);
                Ok(marker)
            }
            Err(Error::UpdateConflict(_)) => {
                let existing = self.store.get::<VersionMarker>(keys::VERSION).await?.value;
                if existing.schema_version > SCHEMA_VERSION {
                    return Err(Error::Config(format!(
                        "键空间版本 {} 高于程序支持的版本 {}",
                        existing.schema_version, SCHEMA_VERSION
                    )));
                }
                Ok(existing)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{hypervisor, Harness};

    #[tokio::test]
    async fn test_register_and_list_hypervisors() {
        let harness = Harness::new();
        let fleet = FleetService::new(&harness.state);

        fleet
            .register_hypervisor(hypervisor("node2", 8, 8192, HypervisorStatus::Active))
            .await
            .unwrap();
        fleet
            .register_hypervisor(hypervisor("node1", 8, 8192, HypervisorStatus::Inactive))
            .await
            .unwrap();

        let nodes: Vec<_> = fleet
            .list_hypervisors()
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.node)
            .collect();
        assert_eq!(nodes, vec!["node1", "node2"]);

        let updated = fleet
            .set_hypervisor_status("node1", HypervisorStatus::Active)
            .await
            .unwrap();
        assert_eq!(updated.status, HypervisorStatus::Active);
    }

    #[tokio::test]
    async fn test_register_rejects_inconsistent_capacity() {
        let harness = Harness::new();
        let fleet = FleetService::new(&harness.state);
        let mut hv = hypervisor("node1", 8, 8192, HypervisorStatus::Active);
        hv.free_cpu = hv.cpu + 1;
        assert!(matches!(
            fleet.register_hypervisor(hv).await.unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_probe_marks_unreachable_agent_as_error() {
        let harness = Harness::new();
        let fleet = FleetService::new(&harness.state);
        harness.add_hypervisor("node1", 8, 8192, HypervisorStatus::Inactive).await;

        let probed = fleet.probe_hypervisor("node1").await.unwrap();
        assert_eq!(probed.status, HypervisorStatus::Active);

        harness.agent.set_unreachable(true);
        let probed = fleet.probe_hypervisor("node1").await.unwrap();
        assert_eq!(probed.status, HypervisorStatus::Error);
    }

    #[tokio::test]
    async fn test_os_template_lookup() {
        let harness = Harness::new();
        let fleet = FleetService::new(&harness.state);
        assert!(fleet.get_os_template("ubuntu22.04").await.unwrap_err().is_not_found());

        harness.add_template("ubuntu22.04").await;
        let template = fleet.get_os_template("ubuntu22.04").await.unwrap();
        assert_eq!(template.vg, "vg0");
    }

    #[tokio::test]
    async fn test_version_marker_written_once() {
        let harness = Harness::new();
        let fleet = FleetService::new(&harness.state);

        let first = fleet.ensure_version_marker().await.unwrap();
        let second = fleet.ensure_version_marker().await.unwrap();
        assert_eq!(first, second);

        harness
            .store()
            .put(
                keys::VERSION,
                &VersionMarker {
                    schema_version: SCHEMA_VERSION + 1,
                    written_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            fleet.ensure_version_marker().await.unwrap_err(),
            Error::Config(_)
        ));
    }
}
