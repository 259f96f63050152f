//! 设备模型
//!
//! 设备是信任的基本单元：由一个不透明的稳定令牌标识的客户端实例。
//! 设备行在首次出现时通过原子 upsert 创建，之后只会被请求活动、
//! 信任评分引擎和异常检测器修改；`is_revoked = true` 只能由管理
//! 操作写入，系统自身永不回退。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 地理位置（由可插拔的 IP 解析器提供，核心不做网络调用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    /// 国家代码（ISO 3166-1 alpha-2）
    pub country_code: Option<String>,
    /// 省/州
    pub region: Option<String>,
    /// 城市
    pub city: Option<String>,
    /// 纬度
    pub lat: Option<f64>,
    /// 经度
    pub lon: Option<f64>,
}

impl GeoLocation {
    /// 用于去重统计的标识值（国家级粒度）
    pub fn dedup_key(&self) -> Option<&str> {
        self.country_code.as_deref()
    }
}

/// 设备观测维度（去重统计用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObservationKind {
    /// 客户端 IP
    Ip,
    /// User-Agent
    UserAgent,
    /// 地理位置（国家级）
    Geo,
}

impl ObservationKind {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationKind::Ip => "ip",
            ObservationKind::UserAgent => "user_agent",
            ObservationKind::Geo => "geo",
        }
    }

    /// 从字符串转换
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ip" => Some(ObservationKind::Ip),
            "user_agent" => Some(ObservationKind::UserAgent),
            "geo" => Some(ObservationKind::Geo),
            _ => None,
        }
    }
}

/// 信任分因子明细
///
/// 每次重算都会连同总分一起持久化，保证评分结果可审计。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TrustFactors {
    /// 基准分
    pub base: i32,
    /// 设备年龄加分
    pub device_age: i32,
    /// 认证失败扣分
    pub failed_auth: i32,
    /// 吊销/可疑状态扣分
    pub status_penalty: i32,
    /// 近 7 天活跃度加分
    pub recent_activity: i32,
    /// 地理位置一致性加分
    pub geo_consistency: i32,
    /// 总请求量调整
    pub volume: i32,
}

impl TrustFactors {
    /// 因子求和（clamp 之前的原始值）
    pub fn raw_total(&self) -> i32 {
        self.base
            + self.device_age
            + self.failed_auth
            + self.status_penalty
            + self.recent_activity
            + self.geo_consistency
            + self.volume
    }
}

/// 设备实体（对应 waveguard_devices 表）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// 设备ID（不透明令牌，唯一）
    pub device_id: String,
    /// 关联过的 Profile ID 列表（弱引用，仅供外部 profile 解析层回查）
    pub profile_ids: Vec<String>,
    /// 首次出现时间
    pub first_seen_at: DateTime<Utc>,
    /// 最后活跃时间
    pub last_seen_at: DateTime<Utc>,
    /// 累计请求数
    pub request_count: u64,
    /// 认证失败次数
    pub failed_auth_count: u32,
    /// 最后一次认证失败时间
    pub last_failed_auth_at: Option<DateTime<Utc>>,
    /// 是否已吊销（永久，优先于其他一切检查）
    pub is_revoked: bool,
    /// 吊销时间
    pub revoked_at: Option<DateTime<Utc>>,
    /// 吊销原因
    pub revoked_reason: Option<String>,
    /// 是否被标记为可疑
    pub is_suspicious: bool,
    /// 信任分（0-100）
    pub trust_score: i32,
    /// 信任分因子明细
    pub trust_score_factors: TrustFactors,
    /// 信任分更新时间
    pub trust_score_updated_at: Option<DateTime<Utc>>,
    /// 上次评分时的请求计数（重算触发条件：+10 请求或 24 小时）
    pub trust_scored_request_count: u64,
    /// 会话过期时间
    pub session_expires_at: Option<DateTime<Utc>>,
    /// 最近一次上报的客户端 IP
    pub ip: Option<String>,
    /// 最近一次上报的 User-Agent
    pub user_agent: Option<String>,
    /// 最近一次解析出的地理位置
    pub geo: Option<GeoLocation>,
}

impl Device {
    /// 首次出现时创建设备行（request_count 从 0 开始，由 upsert 统一自增）
    pub fn first_seen(device_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            profile_ids: Vec::new(),
            first_seen_at: now,
            last_seen_at: now,
            request_count: 0,
            failed_auth_count: 0,
            last_failed_auth_at: None,
            is_revoked: false,
            revoked_at: None,
            revoked_reason: None,
            is_suspicious: false,
            trust_score: 50,
            trust_score_factors: TrustFactors {
                base: 50,
                ..TrustFactors::default()
            },
            trust_score_updated_at: None,
            trust_scored_request_count: 0,
            session_expires_at: None,
            ip: None,
            user_agent: None,
            geo: None,
        }
    }

    /// 生成快照（跨组件传递的只读视图）
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: self.device_id.clone(),
            first_seen_at: self.first_seen_at,
            last_seen_at: self.last_seen_at,
            request_count: self.request_count,
            failed_auth_count: self.failed_auth_count,
            is_revoked: self.is_revoked,
            is_suspicious: self.is_suspicious,
            trust_score: self.trust_score,
            session_expires_at: self.session_expires_at,
        }
    }

    /// 生成安全状态视图（管理面 getSecurityStatus）
    pub fn security_status(&self) -> SecurityStatus {
        SecurityStatus {
            device_id: self.device_id.clone(),
            is_revoked: self.is_revoked,
            is_suspicious: self.is_suspicious,
            failed_auth_count: self.failed_auth_count,
            request_count: self.request_count,
            last_seen_at: self.last_seen_at,
            revoked_reason: self.revoked_reason.clone(),
        }
    }
}

/// 设备快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub request_count: u64,
    pub failed_auth_count: u32,
    pub is_revoked: bool,
    pub is_suspicious: bool,
    pub trust_score: i32,
    pub session_expires_at: Option<DateTime<Utc>>,
}

/// 设备安全状态（管理面视图）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityStatus {
    pub device_id: String,
    pub is_revoked: bool,
    pub is_suspicious: bool,
    pub failed_auth_count: u32,
    pub request_count: u64,
    pub last_seen_at: DateTime<Utc>,
    pub revoked_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_seen_defaults() {
        let now = Utc::now();
        let device = Device::first_seen("device-1", now);

        assert_eq!(device.request_count, 0);
        assert_eq!(device.trust_score, 50);
        assert!(!device.is_revoked);
        assert!(!device.is_suspicious);
        assert_eq!(device.first_seen_at, device.last_seen_at);
    }

    #[test]
    fn test_observation_kind_roundtrip() {
        for kind in [
            ObservationKind::Ip,
            ObservationKind::UserAgent,
            ObservationKind::Geo,
        ] {
            assert_eq!(ObservationKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(ObservationKind::from_str("unknown"), None);
    }
}
