//! 异常检测器
//!
//! 一组确定性阈值规则，不是训练出来的模型：便宜、可解释、对低数据
//! 设备没有冷启动问题。每条命中规则按权重累加风险分（clamp 到 100），
//! 风险分映射四档风险等级。
//!
//! high / critical 只会把设备标记为可疑并写审计事件，绝不自动吊销 ——
//! 吊销永远是显式的管理操作。
//!
//! 检测跑在请求路径之外的"非关键路径"上：特征提取或快照写入失败时
//! 跳过本轮、记一条告警，绝不阻塞请求本身。

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::AnomalyThresholds;
use crate::error::Result;
use crate::model::{
    AnomalyFeatures, AnomalySnapshot, AuditEventType, Device, ObservationKind, RiskLevel, Severity,
};
use crate::security::audit::AuditLog;
use crate::security::ACTIVITY_LOG_KEY;
use crate::store::{AnomalyStore, DeviceStore, RateLimitStore};

/// 异常检测器
#[derive(Clone)]
pub struct AnomalyDetector {
    devices: Arc<dyn DeviceStore>,
    activity_log: Arc<dyn RateLimitStore>,
    snapshots: Arc<dyn AnomalyStore>,
    audit: AuditLog,
    thresholds: AnomalyThresholds,
}

impl AnomalyDetector {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        activity_log: Arc<dyn RateLimitStore>,
        snapshots: Arc<dyn AnomalyStore>,
        audit: AuditLog,
        thresholds: AnomalyThresholds,
    ) -> Self {
        Self {
            devices,
            activity_log,
            snapshots,
            audit,
            thresholds,
        }
    }

    /// 从活动日志与观测统计提取特征向量
    pub async fn extract_features(
        &self,
        device: &Device,
        now: DateTime<Utc>,
    ) -> Result<AnomalyFeatures> {
        let day_ago = now - Duration::hours(24);
        let hour_ago = now - Duration::hours(1);
        let timestamps = self
            .activity_log
            .timestamps_since(ACTIVITY_LOG_KEY, &device.device_id, day_ago)
            .await?;

        let requests_last_day = timestamps.len() as u32;
        let mut requests_last_hour = 0u32;
        // 近 1 小时按分钟分桶（突发检测），之前 23 小时按小时分桶（z-score 基线）
        let mut minute_buckets = [0u32; 60];
        let mut hourly_history = vec![0u32; 23];
        for ts in &timestamps {
            if *ts > hour_ago {
                requests_last_hour += 1;
                let minute = ((now - *ts).num_seconds() / 60).clamp(0, 59) as usize;
                minute_buckets[minute] += 1;
            } else {
                let hour = ((now - *ts).num_seconds() / 3600).clamp(1, 23) as usize;
                hourly_history[hour - 1] += 1;
            }
        }
        let burst_count_last_hour = minute_buckets.iter().copied().max().unwrap_or(0);

        let failed_auth_ratio = if device.request_count > 0 {
            device.failed_auth_count as f64 / device.request_count as f64
        } else {
            0.0
        };

        let distinct_ips_seen = self
            .devices
            .distinct_observation_count(&device.device_id, ObservationKind::Ip)
            .await?;
        let distinct_user_agents_seen = self
            .devices
            .distinct_observation_count(&device.device_id, ObservationKind::UserAgent)
            .await?;

        Ok(AnomalyFeatures {
            requests_last_hour,
            requests_last_day,
            failed_auth_ratio,
            distinct_ips_seen,
            distinct_user_agents_seen,
            burst_count_last_hour,
            hourly_history,
        })
    }

    /// 近 1 小时请求数相对设备自身历史的 z-score
    ///
    /// 历史不足（活跃小时桶少于下限）或方差为零时返回 None，
    /// 规则静默跳过，低数据设备不会被误判。
    fn request_rate_zscore(&self, features: &AnomalyFeatures) -> Option<f64> {
        let history = &features.hourly_history;
        let active_buckets = history.iter().filter(|c| **c > 0).count();
        if active_buckets < self.thresholds.min_history_buckets {
            return None;
        }
        let n = history.len() as f64;
        let mean = history.iter().map(|c| *c as f64).sum::<f64>() / n;
        let variance = history
            .iter()
            .map(|c| {
                let d = *c as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        let std_dev = variance.sqrt();
        if std_dev == 0.0 {
            return None;
        }
        Some((features.requests_last_hour as f64 - mean) / std_dev)
    }

    /// 对特征向量应用全部规则，返回快照（未落盘）
    ///
    /// `trust_score` 是低信任规则的输入：低分参与（但不单独决定）
    /// 可疑标记。
    pub fn evaluate(
        &self,
        device_id: &str,
        trust_score: i32,
        features: AnomalyFeatures,
        now: DateTime<Utc>,
    ) -> AnomalySnapshot {
        let t = &self.thresholds;
        let mut score = 0u32;
        let mut triggered_rules = Vec::new();
        fn hit(score: &mut u32, rules: &mut Vec<String>, name: &str, weight: u32) {
            *score += weight;
            rules.push(name.to_string());
        }

        if let Some(z) = self.request_rate_zscore(&features) {
            if z > t.zscore_threshold {
                hit(&mut score, &mut triggered_rules, "request_rate_zscore", t.high_contribution);
            }
        }
        if features.failed_auth_ratio > t.failed_auth_ratio_threshold {
            hit(&mut score, &mut triggered_rules, "failed_auth_ratio", t.high_contribution);
        }
        if features.distinct_ips_seen > t.distinct_ip_threshold {
            hit(&mut score, &mut triggered_rules, "distinct_ip_spread", t.medium_contribution);
        }
        if features.distinct_user_agents_seen > t.distinct_user_agent_threshold {
            hit(
                &mut score,
                &mut triggered_rules,
                "distinct_user_agent_spread",
                t.medium_contribution,
            );
        }
        if features.burst_count_last_hour > t.burst_threshold {
            hit(&mut score, &mut triggered_rules, "request_burst", t.high_contribution);
        }
        if features.requests_last_day > t.daily_request_threshold {
            hit(&mut score, &mut triggered_rules, "daily_volume", t.high_contribution);
        }
        if trust_score < t.low_trust_threshold {
            hit(&mut score, &mut triggered_rules, "low_trust_score", t.low_trust_contribution);
        }

        let risk_score = score.min(100);
        AnomalySnapshot {
            device_id: device_id.to_string(),
            computed_at: now,
            features,
            risk_score,
            risk_level: RiskLevel::from_score(risk_score),
            triggered_rules,
        }
    }

    /// 完整检测：提取特征、评估规则、落盘快照、写回可疑标记
    pub async fn detect(&self, device: &Device, now: DateTime<Utc>) -> Result<AnomalySnapshot> {
        let features = self.extract_features(device, now).await?;
        let snapshot = self.evaluate(&device.device_id, device.trust_score, features, now);

        self.snapshots.store_snapshot(&snapshot).await?;

        if snapshot.risk_level.is_actionable() {
            info!(
                "🔍 检出异常: device={} risk={} rules={:?}",
                device.device_id,
                snapshot.risk_level.as_str(),
                snapshot.triggered_rules
            );

            // 首次进入 high/critical 才写标记转换事件，绝不自动吊销
            if !device.is_suspicious {
                self.devices.set_suspicious(&device.device_id, true).await?;
                self.audit
                    .append(
                        &device.device_id,
                        None,
                        AuditEventType::DeviceMarkedSuspicious,
                        Severity::Warning,
                        serde_json::json!({
                            "risk_score": snapshot.risk_score,
                            "risk_level": snapshot.risk_level.as_str(),
                        }),
                        now,
                    )
                    .await?;
            }

            let severity = match snapshot.risk_level {
                RiskLevel::Critical => Severity::Critical,
                _ => Severity::Warning,
            };
            self.audit
                .append(
                    &device.device_id,
                    None,
                    AuditEventType::AnomalyDetected,
                    severity,
                    serde_json::json!({
                        "risk_score": snapshot.risk_score,
                        "risk_level": snapshot.risk_level.as_str(),
                        "triggered_rules": snapshot.triggered_rules,
                    }),
                    now,
                )
                .await?;
        }

        Ok(snapshot)
    }

    /// 请求路径上的检测入口：任何失败只告警、不向上传播
    pub async fn run_check(&self, device: &Device, now: DateTime<Utc>) {
        if let Err(e) = self.detect(device, now).await {
            warn!(
                "⚠️ 异常检测本轮跳过 device={}: {}",
                device.device_id, e
            );
        }
    }

    /// 设备最近一份快照
    pub async fn latest_snapshot(&self, device_id: &str) -> Result<Option<AnomalySnapshot>> {
        self.snapshots.latest(device_id).await
    }
}
