/// 工具函数集合

use std::net::IpAddr;
use uuid::Uuid;

/// 生成 8 位短 ID
pub fn generate_short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// 按序号生成可读的资源名称，例如 vm-00042
pub fn sequence_name(prefix: &str, value: u64) -> String {
    format!("{}-{:05}", prefix, value)
}

/// 格式化字节大小
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// 验证 IP 地址格式（IPv4 或 IPv6）
pub fn validate_ip_address(ip: &str) -> bool {
    ip.parse::<IpAddr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_short_id() {
        let id = generate_short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sequence_name() {
        assert_eq!(sequence_name("vm", 42), "vm-00042");
        assert_eq!(sequence_name("vol", 123456), "vol-123456");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }

    #[test]
    fn test_validate_ip_address() {
        assert!(validate_ip_address("192.168.1.1"));
        assert!(validate_ip_address("fd00::1"));
        assert!(!validate_ip_address("256.1.1.1"));
        assert!(!validate_ip_address("192.168.1"));
        assert!(!validate_ip_address("invalid"));
    }
}
