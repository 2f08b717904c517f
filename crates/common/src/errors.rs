use thiserror::Error;

/// 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    #[error("资源未找到: {0}")]
    NotFound(String),

    /// CAS 修订号不匹配，未做任何修改
    #[error("更新冲突: {0}")]
    UpdateConflict(String),

    #[error("资源耗尽: {0}")]
    ResourceExhausted(String),

    #[error("参数校验失败: {0}")]
    Validation(String),

    /// 外部协作方（存储、网络、Agent）调用失败，携带对方返回的信息
    #[error("后端调用失败: {0}")]
    Backend(String),

    #[error("非法状态转换: {0}")]
    StateTransition(String),

    #[error("状态存储错误: {0}")]
    Store(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::UpdateConflict(_))
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;
