/// Easy VM Fleet - Controller
///
/// 虚拟化集群控制面：状态存储、调度、IP 地址管理、资源控制器和集群编排

pub mod app_state;
pub mod backends;
pub mod config;
pub mod controllers;
pub mod dto;
pub mod metrics;
pub mod services;
pub mod store;

#[cfg(test)]
pub mod testing;

pub use app_state::AppState;
