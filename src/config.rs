use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use tracing::info;

/// 安全子系统配置
///
/// 信任分权重与异常阈值在源系统里是一组从未经生产数据验证的
/// 启发式常量，这里全部作为可调配置暴露，默认值即规格值。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveguardConfig {
    /// 限流配置
    pub rate_limit: RateLimitConfig,
    /// 会话配置
    pub session: SessionConfig,
    /// 信任评分配置
    pub trust: TrustConfig,
    /// 异常检测配置
    pub anomaly: AnomalyThresholds,
    /// 数据保留配置
    pub retention: RetentionConfig,
}

impl Default for WaveguardConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            session: SessionConfig::default(),
            trust: TrustConfig::default(),
            anomaly: AnomalyThresholds::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl WaveguardConfig {
    /// 创建默认配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 严格模式：更紧的限流与更敏感的异常阈值
    ///
    /// 适用场景：遭受明确的刷量/撞库攻击时临时切换
    pub fn strict() -> Self {
        let mut config = Self::default();
        for class in config.rate_limit.classes.values_mut() {
            class.limit = (class.limit / 2).max(1);
        }
        config.rate_limit.default_class.limit = 30;
        config.anomaly.zscore_threshold = 2.5;
        config.anomaly.distinct_ip_threshold = 5;
        config.anomaly.burst_threshold = 50;
        config.session.timeout_hours = 12;
        config
    }

    /// 宽松模式：放宽限流，只记录很少处罚
    ///
    /// 适用场景：项目早期、客户端行为还不稳定时
    pub fn lenient() -> Self {
        let mut config = Self::default();
        for class in config.rate_limit.classes.values_mut() {
            class.limit *= 3;
        }
        config.rate_limit.default_class.limit = 300;
        config.anomaly.zscore_threshold = 4.0;
        config.anomaly.daily_request_threshold = 50_000;
        config
    }

    /// 从 TOML 文件加载配置（缺失的字段使用默认值）
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let mut config: WaveguardConfig =
            toml::from_str(&content).with_context(|| format!("解析配置失败: {}", path.display()))?;
        config.apply_env_overrides();
        info!("📋 已加载安全配置: {}", path.display());
        Ok(config)
    }

    /// 环境变量覆盖（优先级：环境变量 > 配置文件 > 默认值）
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("WAVEGUARD_SESSION_TIMEOUT_HOURS") {
            if let Ok(hours) = v.parse() {
                self.session.timeout_hours = hours;
            }
        }
        if let Ok(v) = env::var("WAVEGUARD_AUDIT_RETENTION_DAYS") {
            if let Ok(days) = v.parse() {
                self.retention.audit_days = days;
            }
        }
    }
}

/// 单个操作类别的限流规则
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitClass {
    /// 窗口内允许的请求数
    pub limit: u32,
    /// 滑动窗口长度（秒）
    pub window_secs: u64,
}

/// 限流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// 各操作类别的限流规则（key 即限流命名空间）
    pub classes: HashMap<String, RateLimitClass>,
    /// 未登记类别的兜底规则
    pub default_class: RateLimitClass,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut classes = HashMap::new();
        // 点赞/表态：30 次/分钟
        classes.insert(
            "reactions".to_string(),
            RateLimitClass {
                limit: 30,
                window_secs: 60,
            },
        );
        // 收听打点：100 次/分钟
        classes.insert(
            "listens".to_string(),
            RateLimitClass {
                limit: 100,
                window_secs: 60,
            },
        );
        // 剪辑上传：20 次/小时
        classes.insert(
            "clip_uploads".to_string(),
            RateLimitClass {
                limit: 20,
                window_secs: 3600,
            },
        );
        Self {
            classes,
            default_class: RateLimitClass {
                limit: 60,
                window_secs: 60,
            },
        }
    }
}

impl RateLimitConfig {
    /// 查找操作类别对应的规则（未登记则落到兜底规则）
    pub fn class(&self, key: &str) -> RateLimitClass {
        self.classes.get(key).copied().unwrap_or(self.default_class)
    }
}

/// 会话配置
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 会话有效期（小时）
    pub timeout_hours: i64,
    /// 续期阈值（秒）：剩余 TTL 低于该值才实际写库，避免每请求写放大
    pub refresh_threshold_secs: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_hours: 24,
            refresh_threshold_secs: 3600,
        }
    }
}

/// 信任评分配置
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// 权重表
    pub weights: TrustWeights,
    /// 每累计多少次请求触发一次重算
    pub recalc_every_requests: u64,
    /// 距上次重算超过多少小时强制重算
    pub recalc_interval_hours: i64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            weights: TrustWeights::default(),
            recalc_every_requests: 10,
            recalc_interval_hours: 24,
        }
    }
}

/// 信任分权重表（默认值即规格表）
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustWeights {
    /// 基准分
    pub base_score: i32,

    /// 设备年龄加分：≥90天 / ≥30天 / ≥7天 / ≥1天
    pub age_points_90d: i32,
    pub age_points_30d: i32,
    pub age_points_7d: i32,
    pub age_points_1d: i32,

    /// 认证失败扣分：≥20次 / ≥10次 / ≥5次 / ≥1次
    pub failed_auth_penalty_20: i32,
    pub failed_auth_penalty_10: i32,
    pub failed_auth_penalty_5: i32,
    pub failed_auth_penalty_1: i32,

    /// 状态扣分：已吊销 / 可疑（未吊销）
    pub revoked_penalty: i32,
    pub suspicious_penalty: i32,

    /// 近 7 天请求数加分：≥100 / ≥50 / ≥20 / ≥5
    pub recent_points_100: i32,
    pub recent_points_50: i32,
    pub recent_points_20: i32,
    pub recent_points_5: i32,

    /// 去重地理位置加分：1处 / 2处 / 3处（≥4处不加分）
    pub geo_points_1: i32,
    pub geo_points_2: i32,
    pub geo_points_3: i32,

    /// 总请求量调整：10~10,000 / 5~50,000 / >100,000
    pub volume_mid_points: i32,
    pub volume_low_points: i32,
    pub volume_excess_penalty: i32,
}

impl Default for TrustWeights {
    fn default() -> Self {
        Self {
            base_score: 50,
            age_points_90d: 30,
            age_points_30d: 20,
            age_points_7d: 10,
            age_points_1d: 5,
            failed_auth_penalty_20: -40,
            failed_auth_penalty_10: -25,
            failed_auth_penalty_5: -15,
            failed_auth_penalty_1: -5,
            revoked_penalty: -50,
            suspicious_penalty: -30,
            recent_points_100: 20,
            recent_points_50: 15,
            recent_points_20: 10,
            recent_points_5: 5,
            geo_points_1: 15,
            geo_points_2: 10,
            geo_points_3: 5,
            volume_mid_points: 10,
            volume_low_points: 5,
            volume_excess_penalty: -10,
        }
    }
}

/// 异常检测阈值与规则权重
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyThresholds {
    /// 近 1 小时请求数的 z-score 阈值（相对设备自身历史）
    pub zscore_threshold: f64,
    /// 认证失败占比阈值
    pub failed_auth_ratio_threshold: f64,
    /// 去重 IP 数阈值
    pub distinct_ip_threshold: u32,
    /// 去重 User-Agent 数阈值
    pub distinct_user_agent_threshold: u32,
    /// 单分钟突发请求数阈值
    pub burst_threshold: u32,
    /// 单日请求数阈值
    pub daily_request_threshold: u32,
    /// 信任分低于该值时参与（但不单独决定）可疑标记
    pub low_trust_threshold: i32,

    /// 高权重规则的风险分贡献
    ///
    /// 取 50：单条高权重规则命中即落入 high 档（50-74），
    /// 两条及以上进入 critical。
    pub high_contribution: u32,
    /// 中权重规则的风险分贡献（两条中权重规则仍停留在 medium 档）
    pub medium_contribution: u32,
    /// 低信任规则的风险分贡献
    ///
    /// 取 30：单独命中停留在 medium 档（不单独决定可疑标记），
    /// 叠加任意一条中权重规则即跨入 high。
    pub low_trust_contribution: u32,

    /// z-score 规则生效所需的最小历史小时桶数（冷启动保护）
    pub min_history_buckets: usize,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            zscore_threshold: 3.0,
            failed_auth_ratio_threshold: 0.5,
            distinct_ip_threshold: 10,
            distinct_user_agent_threshold: 5,
            burst_threshold: 100,
            daily_request_threshold: 10_000,
            low_trust_threshold: 20,
            high_contribution: 50,
            medium_contribution: 20,
            low_trust_contribution: 30,
            min_history_buckets: 3,
        }
    }
}

/// 数据保留配置（清理是顾问性的，不影响正确性）
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// 限流日志保留时长（小时）
    pub rate_limit_hours: i64,
    /// 设备活动日志保留时长（天）—— 信任分"近 7 天请求数"因子的数据来源，
    /// 不得短于 7 天
    pub activity_days: i64,
    /// 审计事件保留时长（天）
    pub audit_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            rate_limit_hours: 24,
            activity_days: 7,
            audit_days: 90,
        }
    }
}
