/// 外部协作方
///
/// 存储、网络和宿主机 Agent 的抽象接口及默认实现

pub mod agent;
pub mod network;
pub mod volume;

pub use agent::{AgentClient, DispatchPolicy, HttpAgentClient};
pub use network::{BridgeNetworkBackend, NetworkBackend};
pub use volume::{CommandVolumeBackend, VolumeBackend};
