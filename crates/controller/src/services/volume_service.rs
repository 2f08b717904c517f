/// 存储卷管理服务
///
/// 只负责写入期望状态（PENDING 记录、删除标记），实际创建和删除由存储卷控制器完成

use chrono::Utc;
use common::models::{ResourceMeta, Server, Volume, VolumeBackendType, VolumeLocation, VolumeSource, VolumeStatus};
use common::utils::sequence_name;
use common::{keys, Error, Result};
use tracing::info;
use validator::Validate;

use crate::app_state::AppState;
use crate::dto::{validation_error, VolumeRequest};
use crate::store::StateStore;

const VOLUME_SEQUENCE: &str = "volume";

pub struct VolumeService {
    store: StateStore,
    image_dir: String,
}

impl VolumeService {
    pub fn new(state: &AppState) -> Self {
        Self {
            store: state.store(),
            image_dir: state.image_dir.clone(),
        }
    }

    fn location(&self, id: &str, request: &VolumeRequest) -> Result<VolumeLocation> {
        match request.backend {
            VolumeBackendType::Lvm => {
                let vg = match (&request.vg, &request.source) {
                    (Some(vg), _) => vg.clone(),
                    (None, Some(VolumeSource::Snapshot { vg, .. })) => vg.clone(),
                    (None, _) => {
                        return Err(Error::Validation("LVM 存储卷必须指定卷组".to_string()))
                    }
                };
                if matches!(request.source, Some(VolumeSource::Image { .. })) {
                    return Err(Error::Validation("LVM 存储卷不能从磁盘镜像创建".to_string()));
                }
                Ok(VolumeLocation::Lvm {
                    vg,
                    lv: id.to_string(),
                })
            }
            VolumeBackendType::DiskImage => {
                if matches!(request.source, Some(VolumeSource::Snapshot { .. })) {
                    return Err(Error::Validation("磁盘镜像不能从 LVM 快照创建".to_string()));
                }
                Ok(VolumeLocation::File {
                    path: format!("{}/{}.qcow2", self.image_dir.trim_end_matches('/'), id),
                })
            }
        }
    }

    /// 创建存储卷，记录以 PENDING 状态写入
    pub async fn create_new_volume(&self, request: VolumeRequest) -> Result<Volume> {
        request.validate().map_err(validation_error)?;
        // 先校验再分配 id，避免无效请求消耗序列号
        self.location("", &request)?;

        let id = sequence_name("vol", self.store.next_sequence(VOLUME_SEQUENCE).await?);
        let volume = Volume {
            id: id.clone(),
            name: request.name.clone(),
            backend: request.backend,
            kind: request.kind,
            size_bytes: request.size_bytes,
            location: self.location(&id, &request)?,
            source: request.source,
            status: VolumeStatus::Pending,
            meta: ResourceMeta::new(),
        };

        self.store.create(&keys::volume(&id), &volume).await?;
        info!("✅ 存储卷已提交: {} ({})", volume.name, id);
        Ok(volume)
    }

    /// 标记删除，宽限期后由控制器删除；仍被虚拟机引用时拒绝
    pub async fn remove_volume(&self, id: &str) -> Result<Volume> {
        let servers = self.store.list::<Server>(keys::SERVERS).await?;
        if let Some(owner) = servers.iter().find(|s| {
            s.value.boot_volume.as_deref() == Some(id) || s.value.data_volumes.iter().any(|v| v == id)
        }) {
            return Err(Error::Validation(format!(
                "存储卷 {} 仍被虚拟机 {} 使用",
                id, owner.value.id
            )));
        }

        let updated = self
            .store
            .update::<Volume, _>(&keys::volume(id), |v| {
                if v.meta.mark_for_deletion(Utc::now()) {
                    v.meta.touch();
                }
                Ok(())
            })
            .await?;
        info!("存储卷 {} 已标记删除", id);
        Ok(updated.value)
    }

    pub async fn get_volume(&self, id: &str) -> Result<Volume> {
        match self.store.find::<Volume>(&keys::volume(id)).await? {
            Some(v) => Ok(v.value),
            None => Err(Error::NotFound(format!("存储卷 {} 不存在", id))),
        }
    }

    pub async fn list_volumes(&self) -> Result<Vec<Volume>> {
        Ok(self
            .store
            .list::<Volume>(keys::VOLUMES)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use common::models::VolumeKind;

    fn request(backend: VolumeBackendType) -> VolumeRequest {
        VolumeRequest {
            name: "data".to_string(),
            backend,
            kind: VolumeKind::Data,
            size_bytes: 1 << 30,
            vg: Some("vg0".to_string()),
            source: None,
        }
    }

    #[tokio::test]
    async fn test_create_volume_records_pending_with_location() {
        let harness = Harness::new();
        let service = VolumeService::new(&harness.state);

        let lvm = service.create_new_volume(request(VolumeBackendType::Lvm)).await.unwrap();
        assert_eq!(lvm.id, "vol-00001");
        assert_eq!(lvm.status, VolumeStatus::Pending);
        assert_eq!(
            lvm.location,
            VolumeLocation::Lvm {
                vg: "vg0".to_string(),
                lv: "vol-00001".to_string()
            }
        );

        let image = service
            .create_new_volume(request(VolumeBackendType::DiskImage))
            .await
            .unwrap();
        assert_eq!(
            image.location,
            VolumeLocation::File {
                path: "/var/lib/images/vol-00002.qcow2".to_string()
            }
        );

        assert_eq!(service.list_volumes().await.unwrap().len(), 2);
        assert_eq!(service.get_volume("vol-00002").await.unwrap(), image);
    }

    #[tokio::test]
    async fn test_invalid_request_creates_nothing() {
        let harness = Harness::new();
        let service = VolumeService::new(&harness.state);

        let mut no_vg = request(VolumeBackendType::Lvm);
        no_vg.vg = None;
        assert!(matches!(
            service.create_new_volume(no_vg).await.unwrap_err(),
            Error::Validation(_)
        ));

        let mut empty = request(VolumeBackendType::Lvm);
        empty.size_bytes = 0;
        assert!(matches!(
            service.create_new_volume(empty).await.unwrap_err(),
            Error::Validation(_)
        ));

        assert!(service.list_volumes().await.unwrap().is_empty());
        assert_eq!(harness.store().next_sequence("volume").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_volume_marks_deletion_once() {
        let harness = Harness::new();
        let service = VolumeService::new(&harness.state);
        let volume = service.create_new_volume(request(VolumeBackendType::Lvm)).await.unwrap();

        let first = service.remove_volume(&volume.id).await.unwrap();
        let second = service.remove_volume(&volume.id).await.unwrap();
        assert!(first.meta.deletion_timestamp.is_some());
        assert_eq!(first.meta.deletion_timestamp, second.meta.deletion_timestamp);

        assert!(service.remove_volume("vol-09999").await.unwrap_err().is_not_found());
    }
}
