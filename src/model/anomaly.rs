//! 异常检测模型
//!
//! 风险分与信任分是正交的两个维度：信任分衡量历史可信度，
//! 风险分衡量近期行为的异常程度。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 行为特征向量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AnomalyFeatures {
    /// 近 1 小时请求数
    pub requests_last_hour: u32,
    /// 近 24 小时请求数
    pub requests_last_day: u32,
    /// 认证失败占比（failed_auth_count / request_count）
    pub failed_auth_ratio: f64,
    /// 观测到的去重 IP 数
    pub distinct_ips_seen: u32,
    /// 观测到的去重 User-Agent 数
    pub distinct_user_agents_seen: u32,
    /// 近 1 小时内单分钟最大请求数
    pub burst_count_last_hour: u32,
    /// 此前 24 小时的逐小时请求数（z-score 基线，随快照落盘便于排查）
    pub hourly_history: Vec<u32>,
}

/// 风险等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// 由累计风险分（0-100）映射风险等级
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=24 => RiskLevel::Low,
            25..=49 => RiskLevel::Medium,
            50..=74 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }

    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    /// 从字符串转换
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }

    /// 高风险及以上（触发可疑标记写回）
    pub fn is_actionable(&self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }
}

/// 异常快照（对应 waveguard_anomaly_snapshots 表）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalySnapshot {
    /// 设备ID
    pub device_id: String,
    /// 计算时间
    pub computed_at: DateTime<Utc>,
    /// 特征向量
    pub features: AnomalyFeatures,
    /// 累计风险分（0-100）
    pub risk_score: u32,
    /// 风险等级
    pub risk_level: RiskLevel,
    /// 命中的规则名（可解释性）
    pub triggered_rules: Vec<String>,
}
