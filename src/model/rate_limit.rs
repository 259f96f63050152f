//! 限流模型
//!
//! 限流日志行 `(key, identifier, timestamp)` 本身只在存储实现内部
//! 出现（waveguard_rate_limit_entries 表）：`key` 区分操作类别
//! （如 "reactions"），`identifier` 通常是设备ID，不同类别互不挤占
//! 配额。对外只暴露检查结果。

/// 限流检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// 是否放行
    pub allowed: bool,
    /// 当前窗口剩余配额
    pub remaining: u32,
    /// 窗口配额上限
    pub limit: u32,
    /// 被拒时的建议重试等待秒数
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    /// 放行
    pub fn allow(remaining: u32, limit: u32) -> Self {
        Self {
            allowed: true,
            remaining,
            limit,
            retry_after_secs: None,
        }
    }

    /// 拒绝（soft deny，附带 retry-after 提示）
    pub fn deny(limit: u32, retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit,
            retry_after_secs: Some(retry_after_secs),
        }
    }
}
