pub mod cluster_service;
pub mod fleet_service;
pub mod ipam_service;
pub mod network_service;
pub mod scheduler_service;
pub mod volume_service;

pub use cluster_service::ClusterService;
pub use fleet_service::FleetService;
pub use ipam_service::IpamService;
pub use network_service::NetworkService;
pub use scheduler_service::SchedulerService;
pub use volume_service::VolumeService;
