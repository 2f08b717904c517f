/// 集群编排服务
///
/// 创建、销毁、启动和停止整组虚拟机。所有校验在任何写入之前完成；之后逐台执行，
/// 单台失败会被标记为 ERROR 并记录在 `ClusterReport` 中，不中断其余虚拟机，
/// 也不回滚已经成功的虚拟机。

use chrono::Utc;
use common::models::{NetworkStatus, OsTemplate, Server, VirtualNetwork, Volume, VolumeStatus};
use common::utils::validate_ip_address;
use common::{keys, Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use validator::Validate;

use crate::app_state::AppState;
use crate::controllers::{
    mark_dispatch_failed, provision, teardown, transition, Phase, Reconcilable, ServerLifecycle,
};
use crate::dto::{validation_error, ClusterConfig, ClusterRef, ClusterReport, NewServer, VmConfig};
use crate::services::scheduler_service::SchedulerService;
use crate::store::{StateStore, Versioned};

pub struct ClusterService {
    store: StateStore,
    scheduler: SchedulerService,
    lifecycle: Arc<ServerLifecycle>,
}

impl ClusterService {
    pub fn new(state: &AppState) -> Self {
        Self {
            store: state.store(),
            scheduler: SchedulerService::new(state),
            lifecycle: Arc::new(ServerLifecycle::new(state)),
        }
    }

    /// 创建集群
    pub async fn create_cluster(&self, config: ClusterConfig) -> Result<ClusterReport> {
        self.validate_cluster(&config).await?;
        info!("🚀 创建集群 {}，共 {} 台虚拟机", config.cluster_name, config.vms.len());

        let mut report = ClusterReport::new(&config.cluster_name);
        for vm in &config.vms {
            let request = NewServer {
                host_name: vm.host_name.clone(),
                cluster_name: config.cluster_name.clone(),
                cpu: vm.cpu,
                memory_mb: vm.memory_mb,
                os_variant: config.os_variant.clone(),
                boot_volume: vm.boot_volume.clone(),
                data_volumes: vm.data_volumes.clone(),
                networks: vm.networks.clone(),
                public_ip: vm.public_ip.clone(),
                private_ip: vm.private_ip.clone(),
            };

            let scheduled = match self.scheduler.schedule(request).await {
                Ok(server) => server,
                Err(e) => {
                    error!("虚拟机 {}/{} 调度失败: {}", config.cluster_name, vm.host_name, e);
                    report.fail(&vm.host_name, None, e);
                    continue;
                }
            };

            self.provision_scheduled(&vm.host_name, scheduled, &mut report).await;
        }

        self.log_report("创建", &report);
        Ok(report)
    }

    /// 创建一台已调度的虚拟机并记录结果。
    ///
    /// 虚拟机控制器同样会认领 INITIALIZING 记录；认领冲突时以记录的当前状态为准，
    /// 不把仍在由控制器创建的虚拟机计为失败。
    async fn provision_scheduled(&self, host_name: &str, scheduled: Versioned<Server>, report: &mut ClusterReport) {
        let id = scheduled.value.id.clone();
        match provision(&self.store, self.lifecycle.as_ref(), scheduled).await {
            Ok(server) if server.value.phase() == Phase::Ready => report.succeeded.push(id),
            Ok(server) => {
                let reason = server.value.meta.last_error.unwrap_or_else(|| "创建失败".to_string());
                report.fail(host_name, Some(&id), reason);
            }
            Err(Error::UpdateConflict(reason)) => {
                debug!("虚拟机 {} 已被控制器认领: {}", id, reason);
                self.record_handoff(host_name, &id, report).await;
            }
            Err(e) => {
                warn!("虚拟机 {} 创建未完成: {}", id, e);
                report.fail(host_name, Some(&id), e);
            }
        }
    }

    async fn record_handoff(&self, host_name: &str, id: &str, report: &mut ClusterReport) {
        let server = match self.store.find::<Server>(&keys::server(id)).await {
            Ok(Some(server)) => server.value,
            Ok(None) => {
                report.fail(host_name, Some(id), format!("虚拟机 {} 已被删除", id));
                return;
            }
            Err(e) => {
                report.fail(host_name, Some(id), e);
                return;
            }
        };

        match server.phase() {
            Phase::Ready | Phase::Idle => report.succeeded.push(server.id),
            Phase::Pending | Phase::Provisioning => {
                info!("虚拟机 {} 由控制器继续创建，当前状态: {}", id, server.status_str());
                report.handed_off.push(server.id);
            }
            Phase::Error => {
                let reason = server.meta.last_error.unwrap_or_else(|| "创建失败".to_string());
                report.fail(host_name, Some(id), reason);
            }
            Phase::Deleting => report.fail(host_name, Some(id), format!("虚拟机 {} 正在删除", id)),
        }
    }

    /// 写入之前的全部校验
    async fn validate_cluster(&self, config: &ClusterConfig) -> Result<()> {
        config.validate().map_err(validation_error)?;
        for vm in &config.vms {
            vm.validate().map_err(validation_error)?;
            for ip in vm.public_ip.iter().chain(vm.private_ip.iter()) {
                if !validate_ip_address(ip) {
                    return Err(Error::Validation(format!(
                        "虚拟机 {} 的地址 {} 无效",
                        vm.host_name, ip
                    )));
                }
            }
        }

        let mut host_names = HashSet::new();
        let mut requested_ips = HashSet::new();
        for vm in &config.vms {
            if !host_names.insert(vm.host_name.as_str()) {
                return Err(Error::Validation(format!(
                    "请求中主机名 {} 重复",
                    vm.host_name
                )));
            }
            for ip in requested_addresses(vm) {
                if !requested_ips.insert(ip) {
                    return Err(Error::Validation(format!("请求中地址 {} 重复", ip)));
                }
            }
        }

        let existing = self.store.list::<Server>(keys::SERVERS).await?;
        let taken: HashSet<&str> = existing.iter().flat_map(|s| s.value.addresses()).collect();
        for vm in &config.vms {
            if existing.iter().any(|s| s.value.is(&vm.host_name, &config.cluster_name)) {
                return Err(Error::Validation(format!(
                    "虚拟机 {}/{} 已存在",
                    config.cluster_name, vm.host_name
                )));
            }
            if let Some(ip) = requested_addresses(vm).find(|ip| taken.contains(ip)) {
                return Err(Error::Validation(format!(
                    "虚拟机 {} 的地址 {} 已被占用",
                    vm.host_name, ip
                )));
            }
        }

        if self
            .store
            .find::<OsTemplate>(&keys::image(&config.os_variant))
            .await?
            .is_none()
        {
            return Err(Error::NotFound(format!("系统模板 {} 不存在", config.os_variant)));
        }

        let mut claimed_volumes = HashSet::new();
        for vm in &config.vms {
            for volume_id in vm.boot_volume.iter().chain(vm.data_volumes.iter()) {
                if !claimed_volumes.insert(volume_id.as_str()) {
                    return Err(Error::Validation(format!("存储卷 {} 被重复引用", volume_id)));
                }
                self.ensure_volume_available(volume_id, &existing).await?;
            }
            for network_id in &vm.networks {
                self.ensure_network_active(network_id).await?;
            }
        }

        Ok(())
    }

    async fn ensure_volume_available(&self, id: &str, servers: &[Versioned<Server>]) -> Result<()> {
        let volume = match self.store.find::<Volume>(&keys::volume(id)).await? {
            Some(v) => v.value,
            None => return Err(Error::Validation(format!("存储卷 {} 不存在", id))),
        };
        if volume.status != VolumeStatus::Available || volume.meta.deletion_timestamp.is_some() {
            return Err(Error::Validation(format!(
                "存储卷 {} 当前状态为 {}，不可使用",
                id,
                volume.status.as_str()
            )));
        }
        let in_use = servers.iter().any(|s| {
            s.value.boot_volume.as_deref() == Some(id) || s.value.data_volumes.iter().any(|v| v == id)
        });
        if in_use {
            return Err(Error::Validation(format!("存储卷 {} 已被其他虚拟机使用", id)));
        }
        Ok(())
    }

    async fn ensure_network_active(&self, id: &str) -> Result<()> {
        match self.store.find::<VirtualNetwork>(&keys::network(id)).await? {
            Some(v) if v.value.status == NetworkStatus::Active && v.value.meta.deletion_timestamp.is_none() => {
                Ok(())
            }
            Some(v) => Err(Error::Validation(format!(
                "虚拟网络 {} 当前状态为 {}，不可接入",
                id,
                v.value.status.as_str()
            ))),
            None => Err(Error::Validation(format!("虚拟网络 {} 不存在", id))),
        }
    }

    /// 按 (主机名, 集群名) 找到目标虚拟机；一台都没有时返回 NotFound
    async fn resolve(&self, target: &ClusterRef, report: &mut ClusterReport) -> Result<Vec<Versioned<Server>>> {
        let servers: Vec<Versioned<Server>> = self
            .store
            .list::<Server>(keys::SERVERS)
            .await?
            .into_iter()
            .filter(|s| s.value.cluster_name == target.cluster_name)
            .collect();

        let resolved: Vec<Versioned<Server>> = if target.host_names.is_empty() {
            servers
        } else {
            let mut resolved = Vec::new();
            for host_name in &target.host_names {
                match servers.iter().find(|s| s.value.is(host_name, &target.cluster_name)) {
                    Some(server) => resolved.push(server.clone()),
                    None => report.missing.push(host_name.clone()),
                }
            }
            resolved
        };

        if resolved.is_empty() {
            return Err(Error::NotFound(format!(
                "集群 {} 中没有找到指定的虚拟机",
                target.cluster_name
            )));
        }
        Ok(resolved)
    }

    /// 销毁集群：标记删除后立即下发 DestroyVM 并清理记录
    pub async fn destroy_cluster(&self, target: &ClusterRef) -> Result<ClusterReport> {
        let mut report = ClusterReport::new(&target.cluster_name);
        let servers = self.resolve(target, &mut report).await?;
        info!("销毁集群 {}，共 {} 台虚拟机", target.cluster_name, servers.len());

        for server in servers {
            let id = server.value.id.clone();
            let host_name = server.value.host_name.clone();

            match self.destroy_server(server).await {
                Ok(true) => report.succeeded.push(id),
                Ok(false) => {
                    let reason = self.last_error(&id).await;
                    report.fail(&host_name, Some(&id), reason);
                }
                Err(e) => {
                    error!("销毁虚拟机 {} 失败: {}", id, e);
                    report.fail(&host_name, Some(&id), e);
                }
            }
        }

        self.log_report("销毁", &report);
        Ok(report)
    }

    async fn destroy_server(&self, mut server: Versioned<Server>) -> Result<bool> {
        if server.value.phase() != Phase::Deleting {
            server.value.meta.mark_for_deletion(Utc::now());
            server = transition(&self.store, server, Phase::Deleting, None).await?;
        }
        teardown(&self.store, self.lifecycle.as_ref(), server).await
    }

    /// 启动集群中处于 STOPPED 的虚拟机，已在运行的视为成功
    pub async fn start_cluster(&self, target: &ClusterRef) -> Result<ClusterReport> {
        self.power(target, true).await
    }

    /// 停止集群中处于 RUNNING 的虚拟机，已停止的视为成功
    pub async fn stop_cluster(&self, target: &ClusterRef) -> Result<ClusterReport> {
        self.power(target, false).await
    }

    async fn power(&self, target: &ClusterRef, start: bool) -> Result<ClusterReport> {
        let (op, from, to) = if start {
            ("启动", Phase::Idle, Phase::Ready)
        } else {
            ("停止", Phase::Ready, Phase::Idle)
        };

        let mut report = ClusterReport::new(&target.cluster_name);
        let servers = self.resolve(target, &mut report).await?;
        info!("{}集群 {}，共 {} 台虚拟机", op, target.cluster_name, servers.len());

        for server in servers {
            let id = server.value.id.clone();
            let host_name = server.value.host_name.clone();
            let phase = server.value.phase();

            if phase == to {
                report.succeeded.push(id);
                continue;
            }
            if phase != from {
                report.fail(
                    &host_name,
                    Some(&id),
                    format!("当前状态 {} 不能{}", server.value.status_str(), op),
                );
                continue;
            }

            let dispatched = if start {
                self.lifecycle.start(&server.value).await
            } else {
                self.lifecycle.stop(&server.value).await
            };

            match dispatched {
                Ok(()) => match transition(&self.store, server, to, None).await {
                    Ok(_) => report.succeeded.push(id),
                    Err(e) => report.fail(&host_name, Some(&id), e),
                },
                Err(e) => {
                    error!("{}虚拟机 {} 失败: {}", op, id, e);
                    if let Err(mark_err) = mark_dispatch_failed(&self.store, server, e.to_string()).await {
                        warn!("标记虚拟机 {} 为 ERROR 失败: {}", id, mark_err);
                    }
                    report.fail(&host_name, Some(&id), e);
                }
            }
        }

        self.log_report(op, &report);
        Ok(report)
    }

    async fn last_error(&self, id: &str) -> String {
        match self.store.find::<Server>(&keys::server(id)).await {
            Ok(Some(server)) => server.value.meta.last_error.unwrap_or_default(),
            Ok(None) => String::new(),
            Err(e) => e.to_string(),
        }
    }

    fn log_report(&self, op: &str, report: &ClusterReport) {
        if report.is_complete() {
            info!("✅ 集群 {} {}完成，成功 {} 台", report.cluster_name, op, report.succeeded.len());
        } else {
            warn!(
                "集群 {} {}部分失败：成功 {} 台，失败 {} 台，未找到 {} 台",
                report.cluster_name,
                op,
                report.succeeded.len(),
                report.failed.len(),
                report.missing.len()
            );
        }
        if !report.handed_off.is_empty() {
            info!("集群 {} 中 {} 台虚拟机仍由控制器创建中", report.cluster_name, report.handed_off.len());
        }
    }
}

fn requested_addresses(vm: &VmConfig) -> impl Iterator<Item = &str> {
    vm.public_ip.as_deref().into_iter().chain(vm.private_ip.as_deref())
}
