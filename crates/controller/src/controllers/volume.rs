/// 存储卷控制器

use async_trait::async_trait;
use common::models::{ResourceMeta, Volume, VolumeLocation, VolumeSource, VolumeStatus};
use common::utils::format_bytes;
use common::{keys, Error, Result};
use std::sync::Arc;
use tracing::info;

use super::{LifecycleHandler, Phase, Reconcilable};
use crate::app_state::AppState;
use crate::backends::VolumeBackend;

impl Reconcilable for Volume {
    const KIND: &'static str = "volume";
    const PREFIX: &'static str = keys::VOLUMES;

    fn id(&self) -> &str {
        &self.id
    }

    fn phase(&self) -> Phase {
        match self.status {
            VolumeStatus::Pending => Phase::Pending,
            VolumeStatus::Provisioning => Phase::Provisioning,
            VolumeStatus::Available => Phase::Ready,
            VolumeStatus::Deleting => Phase::Deleting,
            VolumeStatus::Error => Phase::Error,
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        self.status = match phase {
            Phase::Pending => VolumeStatus::Pending,
            Phase::Provisioning => VolumeStatus::Provisioning,
            Phase::Ready | Phase::Idle => VolumeStatus::Available,
            Phase::Deleting => VolumeStatus::Deleting,
            Phase::Error => VolumeStatus::Error,
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

/// 按存储后端类型创建/删除存储卷
pub struct VolumeLifecycle {
    backend: Arc<dyn VolumeBackend>,
}

impl VolumeLifecycle {
    pub fn new(state: &AppState) -> Self {
        Self {
            backend: state.volume_backend.clone(),
        }
    }
}

/// 字节数向上取整为 MiB
fn size_mb(size_bytes: u64) -> u64 {
    size_bytes.div_ceil(1024 * 1024)
}

#[async_trait]
impl LifecycleHandler<Volume> for VolumeLifecycle {
    async fn create(&self, volume: &mut Volume) -> Result<()> {
        match (&volume.location, &volume.source) {
            (VolumeLocation::Lvm { vg, lv }, source) => {
                let (_, free) = self.backend.check_volume_group(vg).await?;
                if free < volume.size_bytes {
                    return Err(Error::ResourceExhausted(format!(
                        "卷组 {} 剩余 {}，不足以创建 {}",
                        vg,
                        format_bytes(free),
                        format_bytes(volume.size_bytes)
                    )));
                }

                match source {
                    Some(VolumeSource::Snapshot { vg: src_vg, lv: src_lv }) => {
                        self.backend
                            .create_snapshot(src_vg, src_lv, lv, volume.size_bytes)
                            .await?
                    }
                    Some(VolumeSource::Image { path }) => {
                        return Err(Error::Validation(format!(
                            "LVM 存储卷不能从磁盘镜像 {} 创建",
                            path
                        )))
                    }
                    None => self.backend.create_logical_volume(vg, lv, volume.size_bytes).await?,
                }
            }
            (VolumeLocation::File { path }, Some(VolumeSource::Image { path: src })) => {
                self.backend.copy_disk_image(src, path).await?
            }
            (VolumeLocation::File { path }, Some(VolumeSource::Snapshot { .. })) => {
                return Err(Error::Validation(format!("磁盘镜像 {} 不能从 LVM 快照创建", path)))
            }
            (VolumeLocation::File { path }, None) => {
                self.backend
                    .create_disk_image(path, size_mb(volume.size_bytes))
                    .await?
            }
        }

        info!("存储卷 {} ({}) 已在后端创建", volume.name, volume.id);
        Ok(())
    }

    async fn delete(&self, volume: &Volume) -> Result<()> {
        match &volume.location {
            VolumeLocation::Lvm { vg, lv } => self.backend.remove_logical_volume(vg, lv).await,
            VolumeLocation::File { path } => self.backend.remove_disk_image(path).await,
        }
    }
}
