use tracing::warn;

use super::ProxySettings;
use crate::error::{ProxyError, Result};

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 解析并验证端口号（0..=65535）
    pub fn parse_port(value: &str) -> Result<u16> {
        let trimmed = value.trim();
        let port: i64 = trimmed
            .parse()
            .map_err(|_| ProxyError::invalid_port(trimmed))?;

        u16::try_from(port).map_err(|_| ProxyError::invalid_port(trimmed))
    }

    /// 验证远程主机不为空
    pub fn validate_remote_host(host: &str, title: &str) -> Result<()> {
        if host.trim().is_empty() {
            return Err(ProxyError::invalid_config(format!(
                "Remote host of mapping '{}' cannot be empty",
                title
            )));
        }
        Ok(())
    }

    /// 验证进程设置
    pub fn validate_settings(settings: &ProxySettings) -> Result<()> {
        if settings.workers == 0 {
            return Err(ProxyError::invalid_config(
                "workers must be greater than 0",
            ));
        }

        if settings.buffer_size == 0 {
            return Err(ProxyError::invalid_config(
                "buffer_size must be greater than 0",
            ));
        }

        if settings.socket.recv_buffer_size == Some(0) {
            return Err(ProxyError::invalid_config(
                "socket.recv_buffer_size must be greater than 0",
            ));
        }

        if settings.socket.send_buffer_size == Some(0) {
            return Err(ProxyError::invalid_config(
                "socket.send_buffer_size must be greater than 0",
            ));
        }

        // 建议值检查
        if settings.buffer_size > 16 * 1024 * 1024 {
            warn!(
                "buffer_size is very large ({} bytes), every connection pair may park up to two buffers",
                settings.buffer_size
            );
        }

        Ok(())
    }
}
