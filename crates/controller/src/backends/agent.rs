/// 宿主机 Agent 客户端
///
/// 通过 HTTP + JSON 向各宿主机上的 Agent 下发虚拟机操作。所有调用共用一个
/// 可配置的单次请求超时和重试策略；默认 `max_attempts = 1`，即不重试。

use async_trait::async_trait;
use common::models::agent::{AgentResponse, AgentVersion, VmSpec};
use common::models::Placement;
use common::{Error, Result};
use rand::Rng;
use reqwest::{Method, StatusCode};
use std::future::Future;
use std::time::Duration;
use thiserror::Error as ThisError;
use tracing::{debug, info, warn};

/// Agent 客户端接口
#[async_trait]
pub trait AgentClient: Send + Sync + 'static {
    async fn create_vm(&self, target: &Placement, spec: &VmSpec) -> Result<AgentResponse>;

    async fn destroy_vm(&self, target: &Placement, spec: &VmSpec) -> Result<AgentResponse>;

    async fn start_vm(&self, target: &Placement, spec: &VmSpec) -> Result<AgentResponse>;

    async fn stop_vm(&self, target: &Placement, spec: &VmSpec) -> Result<AgentResponse>;

    async fn ping(&self, target: &Placement) -> Result<()>;

    async fn get_version(&self, target: &Placement) -> Result<AgentVersion>;
}

/// 远程调用的超时与重试策略
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// 单次请求超时
    pub timeout: Duration,
    /// 总尝试次数，1 表示不重试
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub jitter_frac: f32,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 1,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(5),
            jitter_frac: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    NonRetryable,
}

/// 单次调用的失败原因
#[derive(Debug, ThisError)]
enum AgentCallError {
    #[error("请求失败: {0}")]
    Request(#[from] reqwest::Error),

    #[error("状态码 {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("响应解析失败: {0}")]
    Decode(String),
}

impl AgentCallError {
    fn classify(&self) -> RetryClass {
        match self {
            AgentCallError::Request(e) if e.is_timeout() || e.is_connect() => RetryClass::Retryable,
            AgentCallError::Request(_) => RetryClass::NonRetryable,
            AgentCallError::Status { status, .. }
                if status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS =>
            {
                RetryClass::Retryable
            }
            _ => RetryClass::NonRetryable,
        }
    }
}

fn jitter(d: Duration, frac: f32) -> Duration {
    let ms = d.as_millis() as i64;
    let delta = (ms as f32 * frac) as i64;
    let j = if delta > 0 {
        rand::thread_rng().gen_range(-delta..=delta)
    } else {
        0
    };
    Duration::from_millis((ms + j).max(0) as u64)
}

/// 按策略执行 `op`，可重试错误之间指数退避
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &DispatchPolicy,
    mut op: F,
    classify: C,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    C: Fn(&E) -> RetryClass,
{
    let attempts = policy.max_attempts.max(1);
    let mut backoff = policy.backoff_base;
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= attempts || classify(&e) == RetryClass::NonRetryable {
                    return Err(e);
                }
                tokio::time::sleep(jitter(backoff.min(policy.backoff_max), policy.jitter_frac)).await;
                backoff = (backoff * 2).min(policy.backoff_max);
                attempt += 1;
            }
        }
    }
}

/// 基于 reqwest 的 Agent 客户端
#[derive(Clone)]
pub struct HttpAgentClient {
    http: reqwest::Client,
    policy: DispatchPolicy,
}

impl HttpAgentClient {
    pub fn new(policy: DispatchPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self { http, policy })
    }

    fn url(target: &Placement, path: &str) -> String {
        format!("http://{}:{}{}", target.ip, target.port, path)
    }

    async fn call_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&VmSpec>,
    ) -> std::result::Result<String, AgentCallError> {
        let mut req = self
            .http
            .request(method, url)
            .timeout(self.policy.timeout);
        if let Some(spec) = body {
            req = req.json(spec);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(AgentCallError::Status { status, body: text });
        }
        Ok(text)
    }

    async fn call(&self, method: Method, target: &Placement, path: &str, body: Option<&VmSpec>) -> Result<String> {
        let url = Self::url(target, path);
        info!("📤 [Controller -> Agent] 发送请求: node={}, {} {}", target.node, method, url);

        let result = retry_with_backoff(
            &self.policy,
            || self.call_once(method.clone(), &url, body),
            |e: &AgentCallError| {
                let class = e.classify();
                if class == RetryClass::Retryable {
                    warn!("请求 {} 失败，准备重试: {}", url, e);
                }
                class
            },
        )
        .await;

        match result {
            Ok(text) => {
                debug!("📥 [Agent -> Controller] 响应内容: {}", text);
                Ok(text)
            }
            Err(e) => Err(Error::Backend(format!(
                "节点 {} 的 {} {} 失败: {}",
                target.node, method, path, e
            ))),
        }
    }

    async fn vm_operation(&self, target: &Placement, path: &str, spec: &VmSpec) -> Result<AgentResponse> {
        let text = self.call(Method::POST, target, path, Some(spec)).await?;
        if text.trim().is_empty() {
            return Ok(AgentResponse::default());
        }
        serde_json::from_str(&text).map_err(|e| {
            Error::Backend(AgentCallError::Decode(format!("{}: {}", e, text)).to_string())
        })
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn create_vm(&self, target: &Placement, spec: &VmSpec) -> Result<AgentResponse> {
        self.vm_operation(target, "/vm/create", spec).await
    }

    async fn destroy_vm(&self, target: &Placement, spec: &VmSpec) -> Result<AgentResponse> {
        self.vm_operation(target, "/vm/destroy", spec).await
    }

    async fn start_vm(&self, target: &Placement, spec: &VmSpec) -> Result<AgentResponse> {
        self.vm_operation(target, "/vm/start", spec).await
    }

    async fn stop_vm(&self, target: &Placement, spec: &VmSpec) -> Result<AgentResponse> {
        self.vm_operation(target, "/vm/stop", spec).await
    }

    async fn ping(&self, target: &Placement) -> Result<()> {
        self.call(Method::GET, target, "/ping", None).await?;
        Ok(())
    }

    async fn get_version(&self, target: &Placement) -> Result<AgentVersion> {
        let text = self.call(Method::GET, target, "/version", None).await?;
        serde_json::from_str(&text).map_err(|e| {
            Error::Backend(AgentCallError::Decode(format!("{}: {}", e, text)).to_string())
        })
    }
}
