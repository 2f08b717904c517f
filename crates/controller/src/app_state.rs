/// 应用全局状态

use prometheus::Registry;
use std::sync::Arc;

use crate::backends::{AgentClient, NetworkBackend, VolumeBackend};
use crate::store::StateStore;

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    /// 状态存储
    pub store: StateStore,
    /// 宿主机 Agent 客户端
    pub agent: Arc<dyn AgentClient>,
    pub volume_backend: Arc<dyn VolumeBackend>,
    pub network_backend: Arc<dyn NetworkBackend>,
    /// 控制器指标注册表
    pub registry: Registry,
    /// 磁盘镜像存放目录
    pub image_dir: String,
}

impl AppState {
    pub fn new(
        store: StateStore,
        agent: Arc<dyn AgentClient>,
        volume_backend: Arc<dyn VolumeBackend>,
        network_backend: Arc<dyn NetworkBackend>,
        image_dir: impl Into<String>,
    ) -> Self {
        Self {
            store,
            agent,
            volume_backend,
            network_backend,
            registry: Registry::new(),
            image_dir: image_dir.into(),
        }
    }

    /// 获取状态存储（克隆）
    pub fn store(&self) -> StateStore {
        self.store.clone()
    }
}
