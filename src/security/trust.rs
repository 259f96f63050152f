//! 信任评分引擎
//!
//! 信任分衡量设备的长期可信度：基准 50 分，按年龄、认证失败、
//! 吊销/可疑状态、近期活跃度、地理一致性、总请求量七个因子加权，
//! clamp 到 [0, 100]。每个因子的得分连同总分一起落盘，评分结果
//! 可审计、可复算。
//!
//! 重算是惰性的：请求计数较上次评分累计 +10，或距上次评分超过
//! 24 小时才触发，评分本身绝不出现在请求热路径的同步开销里。

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::config::{TrustConfig, TrustWeights};
use crate::error::Result;
use crate::model::{Device, ObservationKind, TrustFactors};
use crate::security::ACTIVITY_LOG_KEY;
use crate::store::{DeviceStore, RateLimitStore};

/// 信任分计算输入
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustInputs {
    /// 设备年龄（天）
    pub device_age_days: i64,
    /// 认证失败次数
    pub failed_auth_count: u32,
    /// 是否已吊销
    pub is_revoked: bool,
    /// 是否可疑
    pub is_suspicious: bool,
    /// 近 7 天请求数
    pub requests_last_7d: u32,
    /// 去重地理位置数（国家级）
    pub distinct_geo_locations: u32,
    /// 累计请求总量
    pub total_request_count: u64,
}

/// 纯函数评分：由输入与权重表算出总分与因子明细
///
/// 各因子内部取最高命中档位，档位之间不叠加。
pub fn calculate(weights: &TrustWeights, inputs: &TrustInputs) -> (i32, TrustFactors) {
    let device_age = if inputs.device_age_days >= 90 {
        weights.age_points_90d
    } else if inputs.device_age_days >= 30 {
        weights.age_points_30d
    } else if inputs.device_age_days >= 7 {
        weights.age_points_7d
    } else if inputs.device_age_days >= 1 {
        weights.age_points_1d
    } else {
        0
    };

    let failed_auth = if inputs.failed_auth_count >= 20 {
        weights.failed_auth_penalty_20
    } else if inputs.failed_auth_count >= 10 {
        weights.failed_auth_penalty_10
    } else if inputs.failed_auth_count >= 5 {
        weights.failed_auth_penalty_5
    } else if inputs.failed_auth_count >= 1 {
        weights.failed_auth_penalty_1
    } else {
        0
    };

    let status_penalty = if inputs.is_revoked {
        weights.revoked_penalty
    } else if inputs.is_suspicious {
        weights.suspicious_penalty
    } else {
        0
    };

    let recent_activity = if inputs.requests_last_7d >= 100 {
        weights.recent_points_100
    } else if inputs.requests_last_7d >= 50 {
        weights.recent_points_50
    } else if inputs.requests_last_7d >= 20 {
        weights.recent_points_20
    } else if inputs.requests_last_7d >= 5 {
        weights.recent_points_5
    } else {
        0
    };

    // 1~3 处地理位置说明行为稳定，4 处及以上不再加分
    let geo_consistency = match inputs.distinct_geo_locations {
        1 => weights.geo_points_1,
        2 => weights.geo_points_2,
        3 => weights.geo_points_3,
        _ => 0,
    };

    let volume = if (10..=10_000).contains(&inputs.total_request_count) {
        weights.volume_mid_points
    } else if (5..=50_000).contains(&inputs.total_request_count) {
        weights.volume_low_points
    } else if inputs.total_request_count > 100_000 {
        weights.volume_excess_penalty
    } else {
        0
    };

    let factors = TrustFactors {
        base: weights.base_score,
        device_age,
        failed_auth,
        status_penalty,
        recent_activity,
        geo_consistency,
        volume,
    };
    let score = factors.raw_total().clamp(0, 100);
    (score, factors)
}

/// 信任评分引擎
#[derive(Clone)]
pub struct TrustScoringEngine {
    devices: Arc<dyn DeviceStore>,
    activity_log: Arc<dyn RateLimitStore>,
    config: TrustConfig,
}

impl TrustScoringEngine {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        activity_log: Arc<dyn RateLimitStore>,
        config: TrustConfig,
    ) -> Self {
        Self {
            devices,
            activity_log,
            config,
        }
    }

    /// 重算条件：请求计数较上次评分累计达到阈值，或距上次评分超时
    pub fn needs_recalc(&self, device: &Device, now: DateTime<Utc>) -> bool {
        if device.request_count
            >= device.trust_scored_request_count + self.config.recalc_every_requests
        {
            return true;
        }
        match device.trust_score_updated_at {
            Some(updated_at) => {
                now - updated_at >= Duration::hours(self.config.recalc_interval_hours)
            }
            None => true,
        }
    }

    /// 收集因子输入并重算，持久化总分与因子明细
    pub async fn recalculate(
        &self,
        device: &Device,
        now: DateTime<Utc>,
    ) -> Result<(i32, TrustFactors)> {
        let since = now - Duration::days(7);
        let requests_last_7d = self
            .activity_log
            .count_since(ACTIVITY_LOG_KEY, &device.device_id, since)
            .await?;
        let distinct_geo_locations = self
            .devices
            .distinct_observation_count(&device.device_id, ObservationKind::Geo)
            .await?;

        let inputs = TrustInputs {
            device_age_days: (now - device.first_seen_at).num_days(),
            failed_auth_count: device.failed_auth_count,
            is_revoked: device.is_revoked,
            is_suspicious: device.is_suspicious,
            requests_last_7d,
            distinct_geo_locations,
            total_request_count: device.request_count,
        };
        let (score, factors) = calculate(&self.config.weights, &inputs);

        self.devices
            .store_trust_score(&device.device_id, score, &factors, device.request_count, now)
            .await?;

        debug!(
            "🔍 信任分已重算: device={} score={} (raw={})",
            device.device_id,
            score,
            factors.raw_total()
        );
        Ok((score, factors))
    }

    /// 到期才重算；未到期返回 None
    pub async fn recalculate_if_due(
        &self,
        device: &Device,
        now: DateTime<Utc>,
    ) -> Result<Option<i32>> {
        if !self.needs_recalc(device, now) {
            return Ok(None);
        }
        let (score, _) = self.recalculate(device, now).await?;
        Ok(Some(score))
    }
}
