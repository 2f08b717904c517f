/// 虚拟网络后端
///
/// `BridgeNetworkBackend` 在本机创建 Linux Bridge 并配置网关地址

use async_trait::async_trait;
use common::models::VirtualNetwork;
use common::{Error, Result};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// 虚拟网络后端接口
#[async_trait]
pub trait NetworkBackend: Send + Sync + 'static {
    /// 部署网络，重复调用不应失败
    async fn define(&self, network: &VirtualNetwork) -> Result<()>;

    /// 拆除网络，网络不存在时视为成功
    async fn undefine(&self, network: &VirtualNetwork) -> Result<()>;
}

/// Linux Bridge 网络后端
#[derive(Debug, Clone, Default)]
pub struct BridgeNetworkBackend;

impl BridgeNetworkBackend {
    pub fn new() -> Self {
        Self
    }

    async fn ip(args: &[&str]) -> Result<std::process::Output> {
        debug!("执行命令: ip {}", args.join(" "));
        Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Backend(format!("无法执行 ip 命令: {}", e)))
    }

    async fn ip_checked(args: &[&str]) -> Result<()> {
        let output = Self::ip(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Backend(format!(
                "ip {} 失败: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn bridge_exists(bridge: &str) -> Result<bool> {
        Ok(Self::ip(&["link", "show", bridge]).await?.status.success())
    }
}

#[async_trait]
impl NetworkBackend for BridgeNetworkBackend {
    async fn define(&self, network: &VirtualNetwork) -> Result<()> {
        let bridge = network.spec.bridge.as_str();
        info!("部署虚拟网络 {}，Bridge: {}", network.metadata.name, bridge);

        if !Self::bridge_exists(bridge).await? {
            Self::ip_checked(&["link", "add", "name", bridge, "type", "bridge"]).await?;
        } else {
            info!("Bridge {} 已存在", bridge);
        }

        if let Some(gateway) = &network.gateway {
            Self::ip_checked(&["addr", "replace", gateway, "dev", bridge]).await?;
        }

        Self::ip_checked(&["link", "set", bridge, "up"]).await?;
        Ok(())
    }

    async fn undefine(&self, network: &VirtualNetwork) -> Result<()> {
        let bridge = network.spec.bridge.as_str();
        info!("拆除虚拟网络 {}，Bridge: {}", network.metadata.name, bridge);

        if !Self::bridge_exists(bridge).await? {
            warn!("Bridge {} 不存在，跳过删除", bridge);
            return Ok(());
        }

        Self::ip_checked(&["link", "set", bridge, "down"]).await?;
        Self::ip_checked(&["link", "delete", bridge, "type", "bridge"]).await?;
        Ok(())
    }
}
