/// 存储后端
///
/// 控制面只依赖 `VolumeBackend` 抽象；`CommandVolumeBackend` 通过 LVM 和
/// qemu-img 命令在本机执行

use async_trait::async_trait;
use common::{Error, Result};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

/// 存储后端接口
#[async_trait]
pub trait VolumeBackend: Send + Sync + 'static {
    async fn create_logical_volume(&self, vg: &str, lv: &str, size_bytes: u64) -> Result<()>;

    async fn remove_logical_volume(&self, vg: &str, lv: &str) -> Result<()>;

    async fn create_snapshot(&self, vg: &str, src_lv: &str, snap_lv: &str, size_bytes: u64) -> Result<()>;

    /// 返回 (总字节数, 剩余字节数)
    async fn check_volume_group(&self, vg: &str) -> Result<(u64, u64)>;

    async fn create_disk_image(&self, path: &str, size_mb: u64) -> Result<()>;

    async fn copy_disk_image(&self, src: &str, dst: &str) -> Result<()>;

    async fn remove_disk_image(&self, path: &str) -> Result<()>;
}

/// 基于系统命令的存储后端
#[derive(Debug, Clone, Default)]
pub struct CommandVolumeBackend;

impl CommandVolumeBackend {
    pub fn new() -> Self {
        Self
    }

    async fn run(program: &str, args: &[&str]) -> Result<String> {
        debug!("执行命令: {} {}", program, args.join(" "));

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Backend(format!("无法执行 {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Backend(format!("{} 执行失败: {}", program, stderr.trim())));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// 解析 `vgs --noheadings --units b --nosuffix -o vg_size,vg_free` 的输出
fn parse_vgs_output(output: &str) -> Result<(u64, u64)> {
    let fields: Vec<u64> = output
        .split_whitespace()
        .map(|f| f.parse::<u64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Backend(format!("无法解析 vgs 输出 {:?}: {}", output, e)))?;

    match fields.as_slice() {
        [total, free] => Ok((*total, *free)),
        _ => Err(Error::Backend(format!("vgs 输出格式异常: {:?}", output))),
    }
}

#[async_trait]
impl VolumeBackend for CommandVolumeBackend {
    async fn create_logical_volume(&self, vg: &str, lv: &str, size_bytes: u64) -> Result<()> {
        info!("创建逻辑卷: {}/{} ({} 字节)", vg, lv, size_bytes);
        let size = format!("{}b", size_bytes);
        Self::run("lvcreate", &["-y", "-L", &size, "-n", lv, vg]).await?;
        Ok(())
    }

    async fn remove_logical_volume(&self, vg: &str, lv: &str) -> Result<()> {
        info!("删除逻辑卷: {}/{}", vg, lv);
        let path = format!("{}/{}", vg, lv);
        Self::run("lvremove", &["-f", &path]).await?;
        Ok(())
    }

    async fn create_snapshot(&self, vg: &str, src_lv: &str, snap_lv: &str, size_bytes: u64) -> Result<()> {
        info!("创建快照: {}/{} -> {}", vg, src_lv, snap_lv);
        let size = format!("{}b", size_bytes);
        let source = format!("{}/{}", vg, src_lv);
        Self::run("lvcreate", &["-y", "-s", "-L", &size, "-n", snap_lv, &source]).await?;
        Ok(())
    }

    async fn check_volume_group(&self, vg: &str) -> Result<(u64, u64)> {
        let output = Self::run(
            "vgs",
            &["--noheadings", "--units", "b", "--nosuffix", "-o", "vg_size,vg_free", vg],
        )
        .await?;
        parse_vgs_output(&output)
    }

    async fn create_disk_image(&self, path: &str, size_mb: u64) -> Result<()> {
        info!("创建磁盘镜像: {} ({}MB)", path, size_mb);
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Backend(format!("创建目录失败: {}", e)))?;
        }
        let size = format!("{}M", size_mb);
        Self::run("qemu-img", &["create", "-f", "qcow2", path, &size]).await?;
        Ok(())
    }

    async fn copy_disk_image(&self, src: &str, dst: &str) -> Result<()> {
        info!("复制磁盘镜像: {} -> {}", src, dst);
        Self::run("cp", &["--sparse=always", src, dst]).await?;
        Ok(())
    }

    async fn remove_disk_image(&self, path: &str) -> Result<()> {
        info!("删除磁盘镜像: {}", path);
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            // 已删除视为成功，删除可能被重复执行
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Backend(format!("删除磁盘镜像 {} 失败: {}", path, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vgs_output() {
        assert_eq!(
            parse_vgs_output("  107374182400 53687091200\n").unwrap(),
            (107374182400, 53687091200)
        );
        assert!(parse_vgs_output("  abc 1").is_err());
        assert!(parse_vgs_output("  1").is_err());
    }

    #[tokio::test]
    async fn test_remove_missing_image_is_idempotent() {
        let backend = CommandVolumeBackend::new();
        backend
            .remove_disk_image("/tmp/easy-vm-fleet-does-not-exist.qcow2")
            .await
            .unwrap();
    }
}
