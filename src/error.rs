use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;

/// 安全子系统错误类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SecurityError {
    /// 请求未携带设备令牌（匿名请求一律拒绝）
    DeviceNotFound(String),
    /// 设备已被吊销（永久，不可逆）
    DeviceRevoked(String),
    /// 限流窗口配额耗尽
    RateLimitExceeded {
        /// 限流 key（操作类别）
        key: String,
        /// 建议重试等待秒数
        retry_after_secs: u64,
    },
    /// 会话已过期，需要重新初始化
    SessionExpired(String),
    /// 存储层瞬时故障（fail-closed：拒绝请求，可重试）
    Storage(String),
    /// 配置错误
    Configuration(String),
}

impl fmt::Display for SecurityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityError::DeviceNotFound(id) => write!(f, "Device not found: {}", id),
            SecurityError::DeviceRevoked(id) => write!(f, "Device revoked: {}", id),
            SecurityError::RateLimitExceeded {
                key,
                retry_after_secs,
            } => write!(
                f,
                "Rate limit exceeded for {}: retry after {}s",
                key, retry_after_secs
            ),
            SecurityError::SessionExpired(id) => write!(f, "Session expired: {}", id),
            SecurityError::Storage(msg) => write!(f, "Storage error: {}", msg),
            SecurityError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl StdError for SecurityError {}

impl SecurityError {
    /// 是否属于可重试的瞬时错误
    pub fn is_retryable(&self) -> bool {
        matches!(self, SecurityError::Storage(_))
    }

    /// 机器可读的拒绝原因码
    ///
    /// 这是暴露给调用方的唯一错误内容，trust_score_factors 等
    /// 内部细节仅限管理面查询。
    pub fn reason_code(&self) -> &'static str {
        match self {
            SecurityError::DeviceNotFound(_) => "device_not_found",
            SecurityError::DeviceRevoked(_) => "device_revoked",
            SecurityError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            SecurityError::SessionExpired(_) => "session_expired",
            SecurityError::Storage(_) => "storage_unavailable",
            SecurityError::Configuration(_) => "configuration_error",
        }
    }
}

impl From<sqlx::Error> for SecurityError {
    fn from(err: sqlx::Error) -> Self {
        SecurityError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SecurityError {
    fn from(err: serde_json::Error) -> Self {
        SecurityError::Storage(format!("serialization: {}", err))
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, SecurityError>;
