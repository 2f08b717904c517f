/// 测试辅助：内存状态存储和记录调用的假后端

use async_trait::async_trait;
use common::models::agent::{AgentResponse, AgentVersion, VmSpec};
use common::models::{Hypervisor, HypervisorStatus, OsTemplate, Placement, VirtualNetwork};
use common::{keys, Error, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::app_state::AppState;
use crate::backends::{AgentClient, NetworkBackend, VolumeBackend};
use crate::store::StateStore;

/// 记录每次调用，可按操作名或 "操作:主机名" 注入失败
#[derive(Default)]
pub struct FakeAgent {
    calls: Mutex<Vec<(String, String)>>,
    failures: Mutex<HashSet<String>>,
    unreachable: AtomicBool,
}

impl FakeAgent {
    pub fn fail_on(&self, op: &str) {
        self.failures.lock().unwrap().insert(op.to_string());
    }

    pub fn fail_for(&self, op: &str, host_name: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(format!("{}:{}", op, host_name));
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// (操作, 虚拟机 id)
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|(o, _)| o == op).count()
    }

    fn record(&self, op: &str, spec: &VmSpec) -> Result<AgentResponse> {
        self.calls
            .lock()
            .unwrap()
            .push((op.to_string(), spec.vm_id.clone()));

        let failures = self.failures.lock().unwrap();
        if failures.contains(op) || failures.contains(&format!("{}:{}", op, spec.host_name)) {
            return Ok(AgentResponse {
                code: 500,
                message: format!("{} 失败", op),
                location: None,
            });
        }
        Ok(AgentResponse {
            code: 200,
            message: "ok".to_string(),
            location: None,
        })
    }
}

#[async_trait]
impl AgentClient for FakeAgent {
    async fn create_vm(&self, _target: &Placement, spec: &VmSpec) -> Result<AgentResponse> {
        self.record("create", spec)
    }

    async fn destroy_vm(&self, _target: &Placement, spec: &VmSpec) -> Result<AgentResponse> {
        self.record("destroy", spec)
    }

    async fn start_vm(&self, _target: &Placement, spec: &VmSpec) -> Result<AgentResponse> {
        self.record("start", spec)
    }

    async fn stop_vm(&self, _target: &Placement, spec: &VmSpec) -> Result<AgentResponse> {
        self.record("stop", spec)
    }

    async fn ping(&self, target: &Placement) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Backend(format!("{} 无法连接", target.node)));
        }
        Ok(())
    }

    async fn get_version(&self, _target: &Placement) -> Result<AgentVersion> {
        Ok(AgentVersion {
            version: "0.1.0".to_string(),
            hypervisor: "kvm".to_string(),
        })
    }
}

/// 记录调用的存储后端
pub struct FakeVolumeBackend {
    pub calls: Mutex<Vec<String>>,
    pub fail: AtomicBool,
    pub free_bytes: AtomicU64,
}

impl Default for FakeVolumeBackend {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            free_bytes: AtomicU64::new(u64::MAX / 2),
        }
    }
}

impl FakeVolumeBackend {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Backend("存储后端故障".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeBackend for FakeVolumeBackend {
    async fn create_logical_volume(&self, vg: &str, lv: &str, size_bytes: u64) -> Result<()> {
        self.record(format!("lvcreate {}/{} {}", vg, lv, size_bytes))
    }

    async fn remove_logical_volume(&self, vg: &str, lv: &str) -> Result<()> {
        self.record(format!("lvremove {}/{}", vg, lv))
    }

    async fn create_snapshot(&self, vg: &str, src_lv: &str, snap_lv: &str, _size_bytes: u64) -> Result<()> {
        self.record(format!("snapshot {}/{} {}", vg, src_lv, snap_lv))
    }

    async fn check_volume_group(&self, _vg: &str) -> Result<(u64, u64)> {
        let free = self.free_bytes.load(Ordering::SeqCst);
        Ok((free, free))
    }

    async fn create_disk_image(&self, path: &str, size_mb: u64) -> Result<()> {
        self.record(format!("qemu-img {} {}M", path, size_mb))
    }

    async fn copy_disk_image(&self, src: &str, dst: &str) -> Result<()> {
        self.record(format!("cp {} {}", src, dst))
    }

    async fn remove_disk_image(&self, path: &str) -> Result<()> {
        self.record(format!("rm {}", path))
    }
}

/// 记录调用的网络后端
#[derive(Default)]
pub struct FakeNetworkBackend {
    pub calls: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl FakeNetworkBackend {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Backend("网络后端故障".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkBackend for FakeNetworkBackend {
    async fn define(&self, network: &VirtualNetwork) -> Result<()> {
        self.record(format!(
            "define {} {}",
            network.spec.bridge,
            network.gateway.as_deref().unwrap_or("-")
        ))
    }

    async fn undefine(&self, network: &VirtualNetwork) -> Result<()> {
        self.record(format!("undefine {}", network.spec.bridge))
    }
}

/// 内存存储加全部假后端
pub struct Harness {
    pub state: AppState,
    pub agent: Arc<FakeAgent>,
    pub volumes: Arc<FakeVolumeBackend>,
    pub networks: Arc<FakeNetworkBackend>,
}

impl Harness {
    pub fn new() -> Self {
        let agent = Arc::new(FakeAgent::default());
        let volumes = Arc::new(FakeVolumeBackend::default());
        let networks = Arc::new(FakeNetworkBackend::default());
        let state = AppState::new(
            StateStore::in_memory(),
            agent.clone(),
            volumes.clone(),
            networks.clone(),
            "/var/lib/images",
        );
        Self {
            state,
            agent,
            volumes,
            networks,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.state.store
    }

    pub async fn add_hypervisor(&self, node: &str, free_cpu: u32, free_memory_mb: u64, status: HypervisorStatus) {
        let hv = hypervisor(node, free_cpu, free_memory_mb, status);
        self.state.store.put(&keys::hypervisor(node), &hv).await.unwrap();
    }

    pub async fn add_template(&self, variant: &str) {
        let template = OsTemplate {
            variant: variant.to_string(),
            vg: "vg0".to_string(),
            lv: format!("{}-base", variant),
            size_bytes: 10 * 1024 * 1024 * 1024,
        };
        self.state.store.put(&keys::image(variant), &template).await.unwrap();
    }
}

pub fn hypervisor(node: &str, free_cpu: u32, free_memory_mb: u64, status: HypervisorStatus) -> Hypervisor {
    Hypervisor {
        node: node.to_string(),
        cpu: 64,
        free_cpu,
        memory_mb: 262144,
        free_memory_mb,
        ip: "10.0.0.10".to_string(),
        port: 8000,
        storage_pools: Vec::new(),
        status,
    }
}
