//! 审计事件模型
//!
//! 仅追加、不可变的安全事件流。除固定期限的保留清理外永不修改。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 审计事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// 认证失败
    FailedAuthentication,
    /// 设备被标记可疑
    DeviceMarkedSuspicious,
    /// 设备被吊销
    DeviceRevoked,
    /// 已吊销设备的访问尝试
    RevokedDeviceAccessAttempt,
    /// 可疑设备的访问
    SuspiciousDeviceAccess,
    /// 触发限流
    RateLimitExceeded,
    /// 会话过期
    SessionExpired,
    /// 会话续期
    SessionRefreshed,
    /// 检出异常
    AnomalyDetected,
}

impl AuditEventType {
    /// 转换为字符串（与数据库存储值一致）
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::FailedAuthentication => "failed_authentication",
            AuditEventType::DeviceMarkedSuspicious => "device_marked_suspicious",
            AuditEventType::DeviceRevoked => "device_revoked",
            AuditEventType::RevokedDeviceAccessAttempt => "revoked_device_access_attempt",
            AuditEventType::SuspiciousDeviceAccess => "suspicious_device_access",
            AuditEventType::RateLimitExceeded => "rate_limit_exceeded",
            AuditEventType::SessionExpired => "session_expired",
            AuditEventType::SessionRefreshed => "session_refreshed",
            AuditEventType::AnomalyDetected => "anomaly_detected",
        }
    }

    /// 从字符串转换
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "failed_authentication" => Some(AuditEventType::FailedAuthentication),
            "device_marked_suspicious" => Some(AuditEventType::DeviceMarkedSuspicious),
            "device_revoked" => Some(AuditEventType::DeviceRevoked),
            "revoked_device_access_attempt" => Some(AuditEventType::RevokedDeviceAccessAttempt),
            "suspicious_device_access" => Some(AuditEventType::SuspiciousDeviceAccess),
            "rate_limit_exceeded" => Some(AuditEventType::RateLimitExceeded),
            "session_expired" => Some(AuditEventType::SessionExpired),
            "session_refreshed" => Some(AuditEventType::SessionRefreshed),
            "anomaly_detected" => Some(AuditEventType::AnomalyDetected),
            _ => None,
        }
    }
}

/// 事件严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    /// 从字符串转换
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// 严重度排序值（用于 min_severity 过滤）
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Info => 0,
            Severity::Warning => 1,
            Severity::Error => 2,
            Severity::Critical => 3,
        }
    }
}

/// 审计事件（对应 waveguard_audit_events 表）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// 事件ID
    pub event_id: Uuid,
    /// 设备ID
    pub device_id: String,
    /// 关联的 Profile ID
    pub profile_id: Option<String>,
    /// 事件类型
    pub event_type: AuditEventType,
    /// 结构化详情
    pub details: serde_json::Value,
    /// 严重级别
    pub severity: Severity,
    /// 创建时间
    pub created_at: DateTime<Utc>,
}

/// 审计日志查询条件
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// 按设备过滤
    pub device_id: Option<String>,
    /// 按事件类型过滤
    pub event_type: Option<AuditEventType>,
    /// 严重度下限（error/critical 看板用）
    pub min_severity: Option<Severity>,
    /// 起始时间（含）
    pub since: Option<DateTime<Utc>>,
    /// 截止时间（含）
    pub until: Option<DateTime<Utc>>,
    /// 返回条数上限
    pub limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_roundtrip() {
        let all = [
            AuditEventType::FailedAuthentication,
            AuditEventType::DeviceMarkedSuspicious,
            AuditEventType::DeviceRevoked,
            AuditEventType::RevokedDeviceAccessAttempt,
            AuditEventType::SuspiciousDeviceAccess,
            AuditEventType::RateLimitExceeded,
            AuditEventType::SessionExpired,
            AuditEventType::SessionRefreshed,
            AuditEventType::AnomalyDetected,
        ];
        for t in all {
            assert_eq!(AuditEventType::from_str(t.as_str()), Some(t));
        }
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical.rank() > Severity::Error.rank());
        assert!(Severity::Error.rank() > Severity::Warning.rank());
        assert!(Severity::Warning.rank() > Severity::Info.rank());
    }
}
