/// Easy VM Fleet - 公共库
///
/// 提供控制面各组件共享的数据模型、错误处理、键空间定义和工具函数

pub mod errors;
pub mod keys;
pub mod models;
pub mod utils;

// 重新导出常用类型
pub use errors::{Error, Result};
