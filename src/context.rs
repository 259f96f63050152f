use chrono::{DateTime, Utc};

/// 请求上下文
///
/// 传输层在边界处捕获设备令牌、客户端 IP 和 User-Agent 后显式传入，
/// 安全子系统内部不做任何隐式的"当前请求"读取。
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// 设备ID（不透明令牌，缺失视为匿名请求）
    pub device_id: Option<String>,
    /// 关联的 Profile ID（弱引用，仅用于回查）
    pub profile_id: Option<String>,
    /// 客户端 IP
    pub ip: Option<String>,
    /// User-Agent
    pub user_agent: Option<String>,
    /// 请求时间戳（边界处捕获一次，全程复用）
    pub now: DateTime<Utc>,
}

impl RequestContext {
    /// 创建新的请求上下文
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            profile_id: None,
            ip: None,
            user_agent: None,
            now: Utc::now(),
        }
    }

    /// 创建匿名请求上下文（无设备令牌）
    pub fn anonymous() -> Self {
        Self {
            device_id: None,
            profile_id: None,
            ip: None,
            user_agent: None,
            now: Utc::now(),
        }
    }

    /// 设置 Profile ID
    pub fn with_profile_id(mut self, profile_id: impl Into<String>) -> Self {
        self.profile_id = Some(profile_id.into());
        self
    }

    /// 设置客户端 IP
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// 设置 User-Agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// 覆盖请求时间戳（测试用）
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}
