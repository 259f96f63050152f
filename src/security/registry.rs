//! 设备注册表
//!
//! 设备生命周期的唯一入口。首次接触走原子 upsert（存储层的
//! conditional insert-or-update），注册表自身不做 read-then-write，
//! 因此并发的首次请求不会重复建行，计数也不会丢失。
//!
//! 吊销是永久的：`is_revoked` 一旦写入 true 永不回退，重复吊销
//! 保留首次的时间与原因。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::RequestContext;
use crate::error::{Result, SecurityError};
use crate::geo::GeoResolver;
use crate::model::{
    AuditEventType, Device, DeviceSnapshot, ObservationKind, SecurityStatus, Severity,
};
use crate::security::audit::AuditLog;
use crate::store::{ActivityUpdate, DeviceStore};

/// 设备注册表
#[derive(Clone)]
pub struct DeviceRegistry {
    devices: Arc<dyn DeviceStore>,
    geo: Arc<dyn GeoResolver>,
    audit: AuditLog,
}

impl DeviceRegistry {
    pub fn new(devices: Arc<dyn DeviceStore>, geo: Arc<dyn GeoResolver>, audit: AuditLog) -> Self {
        Self {
            devices,
            geo,
            audit,
        }
    }

    /// 记录一次请求活动：原子地创建或更新设备行
    ///
    /// request_count 自增、last_seen_at 刷新由存储层单次往返完成；
    /// IP / User-Agent / 地理位置观测与 Profile 关联是统计性副产品，
    /// 写入失败只降级告警，不拒绝请求。
    pub async fn record_activity(&self, ctx: &RequestContext) -> Result<Device> {
        let device_id = ctx
            .device_id
            .as_deref()
            .ok_or_else(|| SecurityError::DeviceNotFound("missing device token".to_string()))?;

        let geo = match &ctx.ip {
            Some(ip) => self.geo.resolve(ip).await,
            None => None,
        };

        let update = ActivityUpdate {
            device_id: device_id.to_string(),
            ip: ctx.ip.clone(),
            user_agent: ctx.user_agent.clone(),
            geo: geo.clone(),
            now: ctx.now,
        };
        let device = self.devices.upsert_activity(&update).await?;

        if let Some(ip) = &ctx.ip {
            self.observe(device_id, ObservationKind::Ip, ip, ctx.now).await;
        }
        if let Some(user_agent) = &ctx.user_agent {
            self.observe(device_id, ObservationKind::UserAgent, user_agent, ctx.now)
                .await;
        }
        if let Some(key) = geo.as_ref().and_then(|g| g.dedup_key()) {
            self.observe(device_id, ObservationKind::Geo, key, ctx.now).await;
        }
        if let Some(profile_id) = &ctx.profile_id {
            if let Err(e) = self.devices.attach_profile(device_id, profile_id).await {
                warn!("⚠️ 关联 Profile 失败 device={}: {}", device_id, e);
            }
        }

        Ok(device)
    }

    /// 记录活动并返回设备快照（对外视图，不含内部计数字段）
    pub async fn upsert_activity(&self, ctx: &RequestContext) -> Result<DeviceSnapshot> {
        Ok(self.record_activity(ctx).await?.snapshot())
    }

    async fn observe(&self, device_id: &str, kind: ObservationKind, value: &str, now: DateTime<Utc>) {
        if let Err(e) = self
            .devices
            .record_observation(device_id, kind, value, now)
            .await
        {
            warn!(
                "⚠️ 记录观测值失败 device={} kind={}: {}",
                device_id,
                kind.as_str(),
                e
            );
        }
    }

    /// 查询设备
    pub async fn get(&self, device_id: &str) -> Result<Option<Device>> {
        self.devices.get(device_id).await
    }

    /// 查询设备安全状态（管理面）
    pub async fn get_security_status(&self, device_id: &str) -> Result<SecurityStatus> {
        let device = self
            .devices
            .get(device_id)
            .await?
            .ok_or_else(|| SecurityError::DeviceNotFound(device_id.to_string()))?;
        Ok(device.security_status())
    }

    /// 吊销设备（管理操作，不可逆）
    pub async fn revoke(
        &self,
        device_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Device> {
        let device = self
            .devices
            .revoke(device_id, reason, now)
            .await?
            .ok_or_else(|| SecurityError::DeviceNotFound(device_id.to_string()))?;

        info!("🚫 设备已吊销: device={} reason={}", device_id, reason);

        self.audit
            .append(
                device_id,
                None,
                AuditEventType::DeviceRevoked,
                Severity::Critical,
                serde_json::json!({ "reason": reason }),
                now,
            )
            .await?;

        Ok(device)
    }

    /// 记录一次认证失败（设备不存在时创建，失败同样是首次接触信号）
    pub async fn record_failed_auth(&self, ctx: &RequestContext) -> Result<Device> {
        let device_id = ctx
            .device_id
            .as_deref()
            .ok_or_else(|| SecurityError::DeviceNotFound("missing device token".to_string()))?;

        let device = self.devices.record_failed_auth(device_id, ctx.now).await?;

        self.audit
            .append(
                device_id,
                ctx.profile_id.as_deref(),
                AuditEventType::FailedAuthentication,
                Severity::Warning,
                serde_json::json!({
                    "failed_auth_count": device.failed_auth_count,
                    "ip": ctx.ip,
                }),
                ctx.now,
            )
            .await?;

        Ok(device)
    }

    /// 设备关联过的 Profile ID 列表（弱引用，由外部 profile 层解析）
    pub async fn resolve_profiles(&self, device_id: &str) -> Result<Vec<String>> {
        let device = self
            .devices
            .get(device_id)
            .await?
            .ok_or_else(|| SecurityError::DeviceNotFound(device_id.to_string()))?;
        Ok(device.profile_ids)
    }

    /// 列出被标记可疑的设备
    pub async fn list_suspicious(&self, limit: u32) -> Result<Vec<Device>> {
        self.devices.list_suspicious(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{NullGeoResolver, StaticGeoResolver};
    use crate::model::GeoLocation;
    use crate::store::{MemoryAuditStore, MemoryDeviceStore};

    fn registry_with(geo: Arc<dyn GeoResolver>) -> DeviceRegistry {
        DeviceRegistry::new(
            Arc::new(MemoryDeviceStore::new()),
            geo,
            AuditLog::new(Arc::new(MemoryAuditStore::new())),
        )
    }

    #[tokio::test]
    async fn test_first_contact_creates_device() {
        let registry = registry_with(Arc::new(NullGeoResolver));
        let ctx = RequestContext::new("device-1").with_ip("203.0.113.7");

        let device = registry.record_activity(&ctx).await.unwrap();
        assert_eq!(device.request_count, 1);
        assert_eq!(device.trust_score, 50);
        assert_eq!(device.ip.as_deref(), Some("203.0.113.7"));
    }

    #[tokio::test]
    async fn test_upsert_activity_returns_snapshot() {
        let registry = registry_with(Arc::new(NullGeoResolver));
        let ctx = RequestContext::new("device-1").with_ip("203.0.113.7");

        let snapshot = registry.upsert_activity(&ctx).await.unwrap();
        assert_eq!(snapshot.device_id, "device-1");
        assert_eq!(snapshot.request_count, 1);
        assert_eq!(snapshot.trust_score, 50);
        assert!(!snapshot.is_revoked);
        assert!(snapshot.session_expires_at.is_none());
    }

    #[tokio::test]
    async fn test_anonymous_request_rejected() {
        let registry = registry_with(Arc::new(NullGeoResolver));
        let err = registry
            .record_activity(&RequestContext::anonymous())
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "device_not_found");
    }

    #[tokio::test]
    async fn test_geo_observation_recorded() {
        let resolver = StaticGeoResolver::new();
        resolver.insert(
            "203.0.113.7",
            GeoLocation {
                country_code: Some("DE".to_string()),
                region: None,
                city: Some("Berlin".to_string()),
                lat: None,
                lon: None,
            },
        );
        let registry = registry_with(Arc::new(resolver));

        let ctx = RequestContext::new("device-1").with_ip("203.0.113.7");
        let device = registry.record_activity(&ctx).await.unwrap();
        assert_eq!(
            device.geo.as_ref().and_then(|g| g.dedup_key()),
            Some("DE")
        );
    }

    #[tokio::test]
    async fn test_revoke_unknown_device() {
        let registry = registry_with(Arc::new(NullGeoResolver));
        let err = registry
            .revoke("ghost", "abuse", Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "device_not_found");
    }

    #[tokio::test]
    async fn test_failed_auth_creates_and_counts() {
        let registry = registry_with(Arc::new(NullGeoResolver));
        let ctx = RequestContext::new("device-1");

        let device = registry.record_failed_auth(&ctx).await.unwrap();
        assert_eq!(device.failed_auth_count, 1);
        let device = registry.record_failed_auth(&ctx).await.unwrap();
        assert_eq!(device.failed_auth_count, 2);
        // 认证失败不计入 request_count
        assert_eq!(device.request_count, 0);
    }
}
