/// 上层调用的请求与响应结构

pub mod cluster;
pub mod resource;

pub use cluster::{ClusterConfig, ClusterRef, ClusterReport, VmConfig, VmFailure};
pub use resource::{NetworkRequest, NewServer, VolumeRequest};

use common::Error;
use validator::ValidationErrors;

/// 把 validator 的错误转换为统一错误类型
pub fn validation_error(errors: ValidationErrors) -> Error {
    Error::Validation(errors.to_string())
}
