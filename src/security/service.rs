//! 安全服务门面
//!
//! 对宿主暴露的唯一入口，按固定顺序编排每个请求的检查：
//! 限流 → 吊销 → 会话 → 原子活动更新 → （到期时）信任重算 →
//! 异常检测。策略性拒绝（限流、吊销、过期）以 `AccessDecision`
//! 返回；存储故障以 `Err` 向上传播，调用方必须 fail-closed。
//!
//! 所有安全相关的拒绝都先写审计事件再返回。

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::WaveguardConfig;
use crate::context::RequestContext;
use crate::error::{Result, SecurityError};
use crate::geo::{GeoResolver, NullGeoResolver};
use crate::model::{
    AuditEvent, AuditEventType, AuditQuery, Device, SecurityStatus, Severity,
};
use crate::security::anomaly::AnomalyDetector;
use crate::security::audit::AuditLog;
use crate::security::rate_limiter::SlidingWindowRateLimiter;
use crate::security::registry::DeviceRegistry;
use crate::security::session::SessionManager;
use crate::security::trust::TrustScoringEngine;
use crate::security::ACTIVITY_LOG_KEY;
use crate::store::{
    AnomalyStore, AuditStore, Database, DeviceStore, MemoryAnomalyStore, MemoryAuditStore,
    MemoryDeviceStore, MemoryRateLimitStore, PgAnomalyStore, PgAuditStore, PgDeviceStore,
    PgRateLimitStore, RateLimitStore,
};

/// 存储组合（四张表各一个实现）
#[derive(Clone)]
pub struct SecurityStores {
    pub devices: Arc<dyn DeviceStore>,
    pub rate_limits: Arc<dyn RateLimitStore>,
    pub audits: Arc<dyn AuditStore>,
    pub anomalies: Arc<dyn AnomalyStore>,
}

impl SecurityStores {
    /// 全内存组合（测试与单机部署）
    pub fn in_memory() -> Self {
        Self {
            devices: Arc::new(MemoryDeviceStore::new()),
            rate_limits: Arc::new(MemoryRateLimitStore::new()),
            audits: Arc::new(MemoryAuditStore::new()),
            anomalies: Arc::new(MemoryAnomalyStore::new()),
        }
    }

    /// PostgreSQL 组合（共享同一个连接池）
    pub fn postgres(db: &Database) -> Self {
        Self {
            devices: Arc::new(PgDeviceStore::new(db.pool().clone())),
            rate_limits: Arc::new(PgRateLimitStore::new(db.pool().clone())),
            audits: Arc::new(PgAuditStore::new(db.pool().clone())),
            anomalies: Arc::new(PgAnomalyStore::new(db.pool().clone())),
        }
    }
}

/// 访问决定
///
/// 调用方只拿到放行与否和机器可读的原因码；trust_score_factors
/// 等内部明细仅限管理面查询。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: &'static str,
    pub retry_after_secs: Option<u64>,
}

impl AccessDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: "ok",
            retry_after_secs: None,
        }
    }

    fn deny(reason: &'static str) -> Self {
        Self {
            allowed: false,
            reason,
            retry_after_secs: None,
        }
    }

    fn deny_retryable(reason: &'static str, retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            reason,
            retry_after_secs: Some(retry_after_secs),
        }
    }
}

/// 信任分读缓存的 TTL（写路径上重算/吊销会主动失效）
const TRUST_CACHE_TTL_SECS: u64 = 30;
const TRUST_CACHE_CAPACITY: u64 = 100_000;

/// 安全服务
#[derive(Clone)]
pub struct SecurityService {
    config: WaveguardConfig,
    stores: SecurityStores,
    registry: DeviceRegistry,
    rate_limiter: SlidingWindowRateLimiter,
    sessions: SessionManager,
    trust: TrustScoringEngine,
    anomaly: AnomalyDetector,
    audit: AuditLog,
    trust_cache: moka::future::Cache<String, i32>,
}

impl SecurityService {
    pub fn new(
        config: WaveguardConfig,
        stores: SecurityStores,
        geo: Arc<dyn GeoResolver>,
    ) -> Self {
        let audit = AuditLog::new(stores.audits.clone());
        let registry = DeviceRegistry::new(stores.devices.clone(), geo, audit.clone());
        let rate_limiter =
            SlidingWindowRateLimiter::new(stores.rate_limits.clone(), config.rate_limit.clone());
        let sessions = SessionManager::new(stores.devices.clone(), audit.clone(), config.session);
        let trust = TrustScoringEngine::new(
            stores.devices.clone(),
            stores.rate_limits.clone(),
            config.trust,
        );
        let anomaly = AnomalyDetector::new(
            stores.devices.clone(),
            stores.rate_limits.clone(),
            stores.anomalies.clone(),
            audit.clone(),
            config.anomaly,
        );
        let trust_cache = moka::future::Cache::builder()
            .max_capacity(TRUST_CACHE_CAPACITY)
            .time_to_live(std::time::Duration::from_secs(TRUST_CACHE_TTL_SECS))
            .build();

        Self {
            config,
            stores,
            registry,
            rate_limiter,
            sessions,
            trust,
            anomaly,
            audit,
            trust_cache,
        }
    }

    /// 默认配置 + 全内存存储
    pub fn in_memory() -> Self {
        Self::new(
            WaveguardConfig::default(),
            SecurityStores::in_memory(),
            Arc::new(NullGeoResolver),
        )
    }

    /// 处理一个请求的完整安全检查
    ///
    /// `operation_class` 是限流命名空间（如 "reactions"）。策略拒绝
    /// 返回 `Ok(AccessDecision { allowed: false, .. })`；存储故障返回
    /// `Err`，调用方必须拒绝请求（fail-closed）。
    pub async fn handle_request(
        &self,
        ctx: &RequestContext,
        operation_class: &str,
    ) -> Result<AccessDecision> {
        // 无设备令牌视为匿名，一律拒绝
        let device_id = match ctx.device_id.as_deref() {
            Some(id) => id,
            None => return Ok(AccessDecision::deny("device_not_found")),
        };

        // 1. 限流
        let decision = self
            .rate_limiter
            .check_and_record(operation_class, device_id, ctx.now)
            .await?;
        if !decision.allowed {
            let retry_after_secs = decision.retry_after_secs.unwrap_or(1);
            self.audit
                .append(
                    device_id,
                    ctx.profile_id.as_deref(),
                    AuditEventType::RateLimitExceeded,
                    Severity::Warning,
                    serde_json::json!({
                        "operation_class": operation_class,
                        "limit": decision.limit,
                        "retry_after_secs": retry_after_secs,
                    }),
                    ctx.now,
                )
                .await?;
            return Ok(AccessDecision::deny_retryable(
                "rate_limit_exceeded",
                retry_after_secs,
            ));
        }

        // 2. 吊销与会话检查（针对已知设备；首次接触的设备直接进入登记）
        if let Some(device) = self.registry.get(device_id).await? {
            if device.is_revoked {
                self.audit
                    .append(
                        device_id,
                        ctx.profile_id.as_deref(),
                        AuditEventType::RevokedDeviceAccessAttempt,
                        Severity::Error,
                        serde_json::json!({ "reason": device.revoked_reason }),
                        ctx.now,
                    )
                    .await?;
                return Ok(AccessDecision::deny("device_revoked"));
            }

            // 初始化过会话且已过期：拒绝，要求重新初始化
            if device.session_expires_at.is_some() && !self.sessions.is_valid(&device, ctx.now) {
                self.audit
                    .append(
                        device_id,
                        ctx.profile_id.as_deref(),
                        AuditEventType::SessionExpired,
                        Severity::Info,
                        serde_json::json!({
                            "expired_at": device
                                .session_expires_at
                                .map(|dt| dt.timestamp_millis()),
                        }),
                        ctx.now,
                    )
                    .await?;
                return Ok(AccessDecision::deny("session_expired"));
            }

            // 临近过期时按需续期
            self.sessions.refresh(&device, ctx.now).await?;
        }

        // 3. 原子活动更新 + 活动日志（信任分与异常特征的数据来源）
        let device = self.registry.record_activity(ctx).await?;
        self.rate_limiter
            .record(ACTIVITY_LOG_KEY, device_id, ctx.now)
            .await?;

        // 4. 可疑设备仍放行，但每次访问都留痕
        if device.is_suspicious {
            self.audit
                .append(
                    device_id,
                    ctx.profile_id.as_deref(),
                    AuditEventType::SuspiciousDeviceAccess,
                    Severity::Warning,
                    serde_json::json!({ "trust_score": device.trust_score }),
                    ctx.now,
                )
                .await?;
        }

        // 5. 到期时重算信任分并顺带跑一轮异常检测
        //    （同一触发节奏：+10 请求或 24 小时；非关键路径，失败降级）
        match self.trust.recalculate_if_due(&device, ctx.now).await {
            Ok(Some(_)) => {
                self.trust_cache.invalidate(device_id).await;
                self.anomaly.run_check(&device, ctx.now).await;
            }
            Ok(None) => {}
            Err(e) => warn!("⚠️ 信任分重算本轮跳过 device={}: {}", device_id, e),
        }

        Ok(AccessDecision::allow())
    }

    /// 设备是否被允许访问（吊销优先于信任分与可疑标记）
    pub async fn is_device_allowed(&self, device_id: &str) -> Result<AccessDecision> {
        match self.registry.get(device_id).await? {
            None => Ok(AccessDecision::deny("device_not_found")),
            Some(device) if device.is_revoked => Ok(AccessDecision::deny("device_revoked")),
            Some(_) => Ok(AccessDecision::allow()),
        }
    }

    /// 当前信任分（带短 TTL 读缓存）
    pub async fn current_trust_score(&self, device_id: &str) -> Result<i32> {
        if let Some(score) = self.trust_cache.get(device_id).await {
            return Ok(score);
        }
        let device = self
            .registry
            .get(device_id)
            .await?
            .ok_or_else(|| SecurityError::DeviceNotFound(device_id.to_string()))?;
        self.trust_cache
            .insert(device_id.to_string(), device.trust_score)
            .await;
        Ok(device.trust_score)
    }

    /// 设备关联过的 Profile ID（供外部 profile 解析层回查）
    pub async fn resolve_profiles_for_device(&self, device_id: &str) -> Result<Vec<String>> {
        self.registry.resolve_profiles(device_id).await
    }

    /// 初始化（或重置）设备会话
    pub async fn initialize_session(
        &self,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        self.sessions
            .initialize(device_id, self.config.session.timeout_hours, now)
            .await
    }

    /// 记录一次认证失败并立即重跑异常检测
    pub async fn record_failed_auth(&self, ctx: &RequestContext) -> Result<Device> {
        let device = self.registry.record_failed_auth(ctx).await?;
        self.anomaly.run_check(&device, ctx.now).await;
        Ok(device)
    }

    // ==================== 管理面 ====================

    /// 吊销设备（不可逆）
    pub async fn revoke_device(&self, device_id: &str, reason: &str) -> Result<Device> {
        let device = self.registry.revoke(device_id, reason, Utc::now()).await?;
        self.trust_cache.invalidate(device_id).await;
        Ok(device)
    }

    /// 查询设备安全状态
    pub async fn get_security_status(&self, device_id: &str) -> Result<SecurityStatus> {
        self.registry.get_security_status(device_id).await
    }

    /// 列出可疑设备
    pub async fn list_suspicious_devices(&self, limit: u32) -> Result<Vec<Device>> {
        self.registry.list_suspicious(limit).await
    }

    /// 按条件查询审计日志
    pub async fn query_audit_log(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        self.audit.query(query).await
    }

    // ==================== 保留期清理 ====================

    /// 执行一轮保留期清理
    ///
    /// 顾问性操作，不影响正确性：活动日志保留 7 天（信任分因子的
    /// 数据来源），普通限流 key 收紧到 24 小时，审计事件保留 90 天。
    pub async fn run_retention_cycle(&self, now: DateTime<Utc>) -> Result<()> {
        let retention = self.config.retention;

        let activity_cutoff = now - Duration::days(retention.activity_days);
        let purged = self
            .stores
            .rate_limits
            .purge_older_than(activity_cutoff)
            .await?;

        let rate_cutoff = now - Duration::hours(retention.rate_limit_hours);
        let mut purged_rate = 0u64;
        for key in self.config.rate_limit.classes.keys() {
            purged_rate += self.rate_limiter.purge_key(key, rate_cutoff).await?;
        }

        let purged_audit = self.audit.purge_expired(retention.audit_days, now).await?;

        info!(
            "✅ 保留期清理完成: activity={} rate_limit={} audit={}",
            purged, purged_rate, purged_audit
        );
        Ok(())
    }

    /// 启动后台保留期清理任务（每小时一轮）
    pub fn spawn_retention_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = service.run_retention_cycle(Utc::now()).await {
                    warn!("⚠️ 保留期清理失败: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_anonymous_request_denied() {
        let service = SecurityService::in_memory();
        let decision = service
            .handle_request(&RequestContext::anonymous(), "reactions")
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "device_not_found");
    }

    #[tokio::test]
    async fn test_first_contact_allowed() {
        let service = SecurityService::in_memory();
        let decision = service
            .handle_request(&RequestContext::new("device-1"), "reactions")
            .await
            .unwrap();
        assert!(decision.allowed);

        let status = service.get_security_status("device-1").await.unwrap();
        assert_eq!(status.request_count, 1);
    }

    #[tokio::test]
    async fn test_revocation_dominates() {
        let service = SecurityService::in_memory();
        service
            .handle_request(&RequestContext::new("device-1"), "reactions")
            .await
            .unwrap();
        service.revoke_device("device-1", "abuse").await.unwrap();

        let decision = service.is_device_allowed("device-1").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "device_revoked");

        // 后续请求也被硬拒并留痕
        let decision = service
            .handle_request(&RequestContext::new("device-1"), "reactions")
            .await
            .unwrap();
        assert!(!decision.allowed);
        let events = service
            .query_audit_log(&AuditQuery {
                event_type: Some(AuditEventType::RevokedDeviceAccessAttempt),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_rate_limit_denial_audited() {
        let service = SecurityService::in_memory();
        let ctx = RequestContext::new("device-1");

        for _ in 0..30 {
            let decision = service.handle_request(&ctx, "reactions").await.unwrap();
            assert!(decision.allowed);
        }
        let decision = service.handle_request(&ctx, "reactions").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "rate_limit_exceeded");
        assert!(decision.retry_after_secs.is_some());

        let events = service
            .query_audit_log(&AuditQuery {
                event_type: Some(AuditEventType::RateLimitExceeded),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_session_denied_until_reinitialized() {
        let service = SecurityService::in_memory();
        let now = Utc::now();
        let ctx = RequestContext::new("device-1").with_now(now);

        service.handle_request(&ctx, "reactions").await.unwrap();
        service.initialize_session("device-1", now).await.unwrap();

        // 25 小时后：会话过期
        let later = RequestContext::new("device-1").with_now(now + Duration::hours(25));
        let decision = service.handle_request(&later, "reactions").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "session_expired");

        // 重新初始化后恢复
        service
            .initialize_session("device-1", now + Duration::hours(25))
            .await
            .unwrap();
        let decision = service.handle_request(&later, "reactions").await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_trust_score_cached_and_invalidated_on_revoke() {
        let service = SecurityService::in_memory();
        service
            .handle_request(&RequestContext::new("device-1"), "reactions")
            .await
            .unwrap();

        let score = service.current_trust_score("device-1").await.unwrap();
        assert!((0..=100).contains(&score));

        service.revoke_device("device-1", "abuse").await.unwrap();
        // 吊销后缓存失效，重新读到的分数反映吊销扣分（下一次重算前仍是旧分，
        // 但缓存不能继续提供吊销前的值）
        let _ = service.current_trust_score("device-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_profiles() {
        let service = SecurityService::in_memory();
        let ctx = RequestContext::new("device-1").with_profile_id("profile-7");
        service.handle_request(&ctx, "reactions").await.unwrap();

        let profiles = service.resolve_profiles_for_device("device-1").await.unwrap();
        assert_eq!(profiles, vec!["profile-7".to_string()]);
    }

    #[tokio::test]
    async fn test_retention_cycle_runs() {
        let service = SecurityService::in_memory();
        service
            .handle_request(&RequestContext::new("device-1"), "reactions")
            .await
            .unwrap();
        service.run_retention_cycle(Utc::now()).await.unwrap();
    }
}
