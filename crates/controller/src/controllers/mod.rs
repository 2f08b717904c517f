/// 资源控制器
///
/// 存储卷、虚拟网络和虚拟机共用同一个周期性调谐循环 `Reconciler`，
/// 差异只在于各自的 `LifecycleHandler`（创建/删除策略）和删除宽限期。
///
/// 状态机：
///   PENDING -> PROVISIONING -> READY（AVAILABLE / ACTIVE / RUNNING）
///   PENDING / PROVISIONING / DELETING -> ERROR
///   RUNNING / STOPPED -> ERROR（仅启动、停止下发失败）
///   非 DELETING -> DELETING -> 记录删除
///
/// 所有状态写入都通过 CAS 完成，控制器之间、控制器与编排请求之间不会重复认领同一个实体。

pub mod network;
pub mod server;
pub mod volume;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::models::ResourceMeta;
use common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::ReconcilerMetrics;
use crate::store::{StateStore, Versioned};

pub use network::NetworkLifecycle;
pub use server::ServerLifecycle;
pub use volume::VolumeLifecycle;

/// 与具体资源无关的生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Provisioning,
    /// AVAILABLE / ACTIVE / RUNNING
    Ready,
    /// 已就绪但处于停止状态（仅虚拟机）
    Idle,
    Deleting,
    Error,
}

impl Phase {
    /// 常规状态机：只有未到达终态的实体（PENDING / PROVISIONING / DELETING）可以转为 ERROR。
    /// 已就绪虚拟机的启动、停止失败走 `mark_dispatch_failed`。
    pub fn can_transition_to(self, to: Phase) -> bool {
        use Phase::*;
        match (self, to) {
            (Pending, Provisioning) => true,
            (Provisioning, Ready) => true,
            (Ready, Idle) | (Idle, Ready) => true,
            (Deleting, Deleting) => false,
            (_, Deleting) => true,
            (Pending | Provisioning | Deleting, Error) => true,
            _ => false,
        }
    }
}

/// 可被控制器调谐的资源
pub trait Reconcilable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// 资源类型名称，用于日志和指标
    const KIND: &'static str;
    /// 键空间前缀
    const PREFIX: &'static str;

    fn id(&self) -> &str;

    fn key(&self) -> String {
        format!("{}{}", Self::PREFIX, self.id())
    }

    fn phase(&self) -> Phase;

    fn set_phase(&mut self, phase: Phase);

    fn status_str(&self) -> &'static str;

    fn meta(&self) -> &ResourceMeta;

    fn meta_mut(&mut self) -> &mut ResourceMeta;
}

/// 资源的创建/删除策略
#[async_trait]
pub trait LifecycleHandler<T: Reconcilable>: Send + Sync + 'static {
    /// 创建底层资源，可把产出（路径、地址等）写回 `entity`
    async fn create(&self, entity: &mut T) -> Result<()>;

    /// 删除底层资源
    async fn delete(&self, entity: &T) -> Result<()>;
}

/// 校验并以 CAS 写入状态转换。
///
/// 冲突时重新读取：若对方只修改了删除标记，合并后重试；若状态已被改变，返回 `UpdateConflict`。
pub async fn transition<T: Reconcilable>(
    store: &StateStore,
    current: Versioned<T>,
    to: Phase,
    last_error: Option<String>,
) -> Result<Versioned<T>> {
    let from = current.value.phase();
    if !from.can_transition_to(to) {
        return Err(illegal(&current.value, to));
    }
    write_phase(store, current, to, last_error).await
}

/// 已就绪（READY / IDLE）实体的启动、停止下发失败，转为 ERROR
pub async fn mark_dispatch_failed<T: Reconcilable>(
    store: &StateStore,
    current: Versioned<T>,
    reason: String,
) -> Result<Versioned<T>> {
    if !matches!(current.value.phase(), Phase::Ready | Phase::Idle) {
        return Err(illegal(&current.value, Phase::Error));
    }
    write_phase(store, current, Phase::Error, Some(reason)).await
}

fn illegal<T: Reconcilable>(entity: &T, to: Phase) -> Error {
    Error::StateTransition(format!(
        "{} {} 不能从 {} 转换到 {:?}",
        T::KIND,
        entity.id(),
        entity.status_str(),
        to
    ))
}

async fn write_phase<T: Reconcilable>(
    store: &StateStore,
    current: Versioned<T>,
    to: Phase,
    last_error: Option<String>,
) -> Result<Versioned<T>> {
    let from = current.value.phase();
    let mut next = current.value;
    next.set_phase(to);
    next.meta_mut().touch();
    next.meta_mut().last_error = if to == Phase::Error { last_error } else { None };

    let mut revision = current.revision;
    for _ in 0..3 {
        match store.put_cas(&current.key, revision, &next).await {
            Ok(new_revision) => {
                return Ok(Versioned {
                    key: current.key,
                    revision: new_revision,
                    value: next,
                })
            }
            Err(Error::UpdateConflict(_)) => {
                let latest = store.get::<T>(&current.key).await?;
                if latest.value.phase() != from {
                    return Err(Error::UpdateConflict(format!(
                        "{} {} 已被转换为 {}",
                        T::KIND,
                        next.id(),
                        latest.value.status_str()
                    )));
                }
                if let Some(ts) = latest.value.meta().deletion_timestamp {
                    next.meta_mut().mark_for_deletion(ts);
                }
                revision = latest.revision;
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::UpdateConflict(format!("{} {} 状态写入冲突次数过多", T::KIND, next.id())))
}

/// PENDING 实体：认领为 PROVISIONING，调用创建策略，成功进入 READY，失败进入 ERROR。
///
/// 后端失败不作为错误返回，调用方通过返回实体的阶段判断结果；
/// 认领失败（已被他人认领）返回 `UpdateConflict`。
pub async fn provision<T, H>(store: &StateStore, handler: &H, entity: Versioned<T>) -> Result<Versioned<T>>
where
    T: Reconcilable,
    H: LifecycleHandler<T> + ?Sized,
{
    let claimed = transition(store, entity, Phase::Provisioning, None).await?;
    info!("{} {} 开始创建", T::KIND, claimed.value.id());

    let mut working = claimed.value.clone();
    match handler.create(&mut working).await {
        Ok(()) => {
            let created = Versioned {
                value: working,
                ..claimed
            };
            let ready = transition(store, created, Phase::Ready, None).await?;
            info!("✅ {} {} 创建完成，状态: {}", T::KIND, ready.value.id(), ready.value.status_str());
            Ok(ready)
        }
        Err(e) => {
            error!("{} {} 创建失败: {}", T::KIND, claimed.value.id(), e);
            transition(store, claimed, Phase::Error, Some(e.to_string())).await
        }
    }
}

/// DELETING 实体：调用删除策略，成功后删除记录，失败进入 ERROR。
/// 返回记录是否已删除。
pub async fn teardown<T, H>(store: &StateStore, handler: &H, entity: Versioned<T>) -> Result<bool>
where
    T: Reconcilable,
    H: LifecycleHandler<T> + ?Sized,
{
    match handler.delete(&entity.value).await {
        Ok(()) => {
            store.delete(&entity.key).await?;
            info!("🗑️ {} {} 已删除", T::KIND, entity.value.id());
            Ok(true)
        }
        Err(e) => {
            error!("{} {} 删除失败: {}", T::KIND, entity.value.id(), e);
            transition(store, entity, Phase::Error, Some(e.to_string())).await?;
            Ok(false)
        }
    }
}

/// 控制器参数
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub interval: Duration,
    /// 删除标记后等待多久才开始拆除
    pub grace_period: Duration,
    /// PROVISIONING 超过该时长视为卡死，转为 ERROR
    pub provisioning_timeout: Duration,
}

/// 通用调谐循环
pub struct Reconciler<T, H> {
    store: StateStore,
    handler: Arc<H>,
    settings: ReconcileSettings,
    metrics: ReconcilerMetrics,
    _kind: PhantomData<fn() -> T>,
}

impl<T, H> Reconciler<T, H>
where
    T: Reconcilable,
    H: LifecycleHandler<T>,
{
    pub fn new(store: StateStore, handler: Arc<H>, settings: ReconcileSettings, metrics: ReconcilerMetrics) -> Self {
        Self {
            store,
            handler,
            settings,
            metrics,
            _kind: PhantomData,
        }
    }

    pub fn metrics(&self) -> &ReconcilerMetrics {
        &self.metrics
    }

    /// 执行一轮调谐，返回本轮处理的实体数量
    pub async fn reconcile_once(&self) -> Result<usize> {
        let entities = self.store.list::<T>(T::PREFIX).await?;
        let now = Utc::now();
        let count = entities.len();

        for entity in entities {
            let id = entity.value.id().to_string();
            if let Err(e) = self.reconcile_entity(entity, now).await {
                match e {
                    Error::UpdateConflict(_) => debug!("{} {} 本轮跳过: {}", T::KIND, id, e),
                    _ => warn!("{} {} 调谐失败: {}", T::KIND, id, e),
                }
            }
        }

        self.metrics.passes.inc();
        debug!("{} 控制器第 {} 轮完成，共 {} 个实体", T::KIND, self.metrics.passes.get(), count);
        Ok(count)
    }

    async fn reconcile_entity(&self, entity: Versioned<T>, now: DateTime<Utc>) -> Result<()> {
        let phase = entity.value.phase();

        if phase != Phase::Deleting && entity.value.meta().deletion_due(now, self.settings.grace_period) {
            let marked = transition(&self.store, entity, Phase::Deleting, None).await?;
            self.metrics.transition(marked.value.status_str());
            info!("{} {} 删除宽限期已过，进入 {}", T::KIND, marked.value.id(), marked.value.status_str());
            return Ok(());
        }

        match phase {
            Phase::Pending => {
                let result = provision(&self.store, self.handler.as_ref(), entity).await?;
                if result.value.phase() == Phase::Error {
                    self.metrics.failures.inc();
                }
                self.metrics.transition(result.value.status_str());
            }
            Phase::Provisioning => {
                if entity.value.meta().stale_for(now, self.settings.provisioning_timeout) {
                    warn!("{} {} 创建超时，标记为失败", T::KIND, entity.value.id());
                    let failed = transition(
                        &self.store,
                        entity,
                        Phase::Error,
                        Some("创建超时".to_string()),
                    )
                    .await?;
                    self.metrics.transition(failed.value.status_str());
                }
            }
            Phase::Deleting => {
                if teardown(&self.store, self.handler.as_ref(), entity).await? {
                    self.metrics.transition("removed");
                } else {
                    self.metrics.failures.inc();
                    self.metrics.transition("error");
                }
            }
            Phase::Ready | Phase::Idle | Phase::Error => {}
        }

        Ok(())
    }

    /// 周期运行，收到取消信号后等待当前一轮结束再退出
    pub async fn run(self, shutdown: CancellationToken) {
        info!("🔄 {} 控制器已启动，间隔 {:?}", T::KIND, self.settings.interval);
        let mut interval = tokio::time::interval(self.settings.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        error!("{} 控制器轮询失败: {}", T::KIND, e);
                    }
                }
            }
        }

        info!("{} 控制器已停止", T::KIND);
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        assert!(Phase::Pending.can_transition_to(Phase::Provisioning));
        assert!(Phase::Provisioning.can_transition_to(Phase::Ready));
        assert!(Phase::Provisioning.can_transition_to(Phase::Error));
        assert!(Phase::Ready.can_transition_to(Phase::Deleting));
        assert!(Phase::Error.can_transition_to(Phase::Deleting));
        assert!(Phase::Deleting.can_transition_to(Phase::Error));

        assert!(!Phase::Ready.can_transition_to(Phase::Provisioning));
        assert!(!Phase::Pending.can_transition_to(Phase::Ready));
        assert!(!Phase::Deleting.can_transition_to(Phase::Deleting));
        assert!(!Phase::Error.can_transition_to(Phase::Error));
        assert!(!Phase::Deleting.can_transition_to(Phase::Ready));
        assert!(!Phase::Ready.can_transition_to(Phase::Error));
        assert!(!Phase::Idle.can_transition_to(Phase::Error));
        assert!(Phase::Pending.can_transition_to(Phase::Error));
    }

    #[tokio::test]
    async fn test_ready_entity_fails_only_through_dispatch_path() {
        use crate::testing::Harness;
        use common::keys;
        use common::models::{Volume, VolumeBackendType, VolumeKind, VolumeLocation, VolumeStatus};

        let harness = Harness::new();
        let store = harness.store().clone();
        let volume = Volume {
            id: "vol-00001".to_string(),
            name: "data".to_string(),
            backend: VolumeBackendType::Lvm,
            kind: VolumeKind::Data,
            size_bytes: 1024,
            location: VolumeLocation::Lvm {
                vg: "vg0".to_string(),
                lv: "vol-00001".to_string(),
            },
            source: None,
            status: VolumeStatus::Available,
            meta: ResourceMeta::new(),
        };
        store.put(&keys::volume(&volume.id), &volume).await.unwrap();

        let current = store.get::<Volume>(&keys::volume(&volume.id)).await.unwrap();
        let err = transition(&store, current.clone(), Phase::Error, Some("x".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StateTransition(_)));

        let failed = mark_dispatch_failed(&store, current, "停止失败".to_string()).await.unwrap();
        assert_eq!(failed.value.status, VolumeStatus::Error);
        assert_eq!(failed.value.meta.last_error.as_deref(), Some("停止失败"));

        let again = store.get::<Volume>(&keys::volume(&volume.id)).await.unwrap();
        assert!(matches!(
            mark_dispatch_failed(&store, again, "x".to_string()).await.unwrap_err(),
            Error::StateTransition(_)
        ));
    }
}
