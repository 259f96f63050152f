//! 会话管理器
//!
//! 会话状态只是设备行上的一个过期时间戳，不单独建表。
//! 有效性判定是精确到毫秒的边界比较：`expires_at > now`，
//! 恰好等于 now 视为已过期。
//!
//! 续期是按需的：只有剩余 TTL 低于阈值（默认 1 小时）才实际写库，
//! 活跃设备每个会话周期最多触发一次续期写入，而不是每请求一次。
//! 已过期的会话永不被续期复活，必须重新初始化。

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::error::{Result, SecurityError};
use crate::model::{AuditEventType, Device, Severity};
use crate::security::audit::AuditLog;
use crate::store::DeviceStore;

/// 会话状态视图
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 从未初始化过会话
    NotInitialized,
    /// 会话有效
    Active {
        expires_at: DateTime<Utc>,
        remaining_secs: i64,
    },
    /// 会话已过期（需重新初始化）
    Expired { expired_at: DateTime<Utc> },
}

/// 会话管理器
#[derive(Clone)]
pub struct SessionManager {
    devices: Arc<dyn DeviceStore>,
    audit: AuditLog,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(devices: Arc<dyn DeviceStore>, audit: AuditLog, config: SessionConfig) -> Self {
        Self {
            devices,
            audit,
            config,
        }
    }

    /// 初始化（或重置）设备会话，返回过期时间
    ///
    /// 会话时长由调用方显式给出，续期时沿用配置里的默认时长。
    pub async fn initialize(
        &self,
        device_id: &str,
        timeout_hours: i64,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let expires_at = now + Duration::hours(timeout_hours);
        let updated = self
            .devices
            .set_session_expiry(device_id, Some(expires_at))
            .await?;
        if !updated {
            return Err(SecurityError::DeviceNotFound(device_id.to_string()));
        }
        info!(
            "🚀 会话已初始化: device={} expires_at={}",
            device_id, expires_at
        );
        Ok(expires_at)
    }

    /// 会话是否有效（纯函数，不触存储）
    ///
    /// 吊销的设备没有有效会话；边界精确：expires_at == now 即过期。
    pub fn is_valid(&self, device: &Device, now: DateTime<Utc>) -> bool {
        if device.is_revoked {
            return false;
        }
        match device.session_expires_at {
            Some(expires_at) => expires_at > now,
            None => false,
        }
    }

    /// 按需续期
    ///
    /// 仅当会话有效且剩余 TTL 低于续期阈值时写库；其余情况是 no-op。
    /// 返回新的过期时间（未续期返回 None）。
    pub async fn refresh(
        &self,
        device: &Device,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        if !self.is_valid(device, now) {
            return Ok(None);
        }
        let expires_at = match device.session_expires_at {
            Some(e) => e,
            None => return Ok(None),
        };
        let remaining = expires_at - now;
        if remaining >= Duration::seconds(self.config.refresh_threshold_secs) {
            return Ok(None);
        }

        let new_expires_at = now + Duration::hours(self.config.timeout_hours);
        let updated = self
            .devices
            .set_session_expiry(&device.device_id, Some(new_expires_at))
            .await?;
        if !updated {
            return Ok(None);
        }

        debug!(
            "✅ 会话已续期: device={} expires_at={}",
            device.device_id, new_expires_at
        );
        self.audit
            .append(
                &device.device_id,
                None,
                AuditEventType::SessionRefreshed,
                Severity::Info,
                serde_json::json!({
                    "previous_expires_at": expires_at.timestamp_millis(),
                    "expires_at": new_expires_at.timestamp_millis(),
                }),
                now,
            )
            .await?;

        Ok(Some(new_expires_at))
    }

    /// 会话状态视图
    pub fn get_status(&self, device: &Device, now: DateTime<Utc>) -> SessionState {
        match device.session_expires_at {
            None => SessionState::NotInitialized,
            Some(expires_at) if expires_at > now && !device.is_revoked => SessionState::Active {
                expires_at,
                remaining_secs: (expires_at - now).num_seconds(),
            },
            Some(expires_at) => SessionState::Expired {
                expired_at: expires_at,
            },
        }
    }
}
