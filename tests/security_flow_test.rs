//! 安全子系统端到端集成测试
//!
//! 用全内存存储组合驱动完整的请求检查链路：
//! 限流 → 吊销 → 会话 → 原子活动更新 → 信任重算 → 异常检测。

use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;

use waveguard::model::{AuditEventType, AuditQuery, RiskLevel, Severity};
use waveguard::security::ACTIVITY_LOG_KEY;
use waveguard::store::{ActivityUpdate, DeviceStore, RateLimitStore};
use waveguard::{
    NullGeoResolver, RequestContext, SecurityService, SecurityStores, WaveguardConfig,
};

fn service_with_stores() -> (SecurityService, SecurityStores) {
    let stores = SecurityStores::in_memory();
    let service = SecurityService::new(
        WaveguardConfig::default(),
        stores.clone(),
        Arc::new(NullGeoResolver),
    );
    (service, stores)
}

/// 全新设备首次请求：建行、放行、信任分落在基准 50
#[tokio::test]
async fn test_brand_new_device_scores_base_50() {
    let (service, _) = service_with_stores();

    let decision = service
        .handle_request(&RequestContext::new("fresh-device"), "reactions")
        .await
        .unwrap();
    assert!(decision.allowed);

    // 首次请求触发了初次评分：无年龄、无活跃度加分，只有基准分
    let score = service.current_trust_score("fresh-device").await.unwrap();
    assert_eq!(score, 50);
}

/// 大量认证失败把信任分拉到谷底：50 - 40 = 10
#[tokio::test]
async fn test_failed_auth_crushes_trust_score() {
    let (service, stores) = service_with_stores();
    let now = Utc::now();
    let ctx = RequestContext::new("device-bad").with_now(now);

    service.handle_request(&ctx, "reactions").await.unwrap();
    for _ in 0..25 {
        service.record_failed_auth(&ctx).await.unwrap();
    }

    // 制造重算条件（+10 请求）并触发
    for _ in 0..10 {
        service.handle_request(&ctx, "listens").await.unwrap();
    }

    let device = stores.devices.get("device-bad").await.unwrap().unwrap();
    assert_eq!(device.failed_auth_count, 25);
    assert_eq!(device.trust_score_factors.failed_auth, -40);
    // 认证失败占比早已触发异常检测的可疑标记，状态扣分一并生效
    assert!(device.is_suspicious);
    assert_eq!(device.trust_score_factors.status_penalty, -30);
    // 50 - 40 - 30 + 5(近7天活跃) + 10(请求量) = -5，clamp 到 0
    assert_eq!(device.trust_score, 0);
}

/// 限流：30/分钟，第 0~59 秒内 30 次放行；第 60 秒（同一滚动窗口）
/// 第 31 次被拒；第 61 秒（窗口滚动后）放行
#[tokio::test]
async fn test_sliding_window_rolls_precisely() {
    let (service, _) = service_with_stores();
    let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap();

    for s in 1..=30 {
        let ctx = RequestContext::new("device-1").with_now(t0 + Duration::seconds(s));
        let decision = service.handle_request(&ctx, "reactions").await.unwrap();
        assert!(decision.allowed, "第 {} 秒的请求应被放行", s);
    }

    let at_60 = RequestContext::new("device-1").with_now(t0 + Duration::seconds(60));
    let decision = service.handle_request(&at_60, "reactions").await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, "rate_limit_exceeded");
    assert!(decision.retry_after_secs.is_some());

    let at_61 = RequestContext::new("device-1").with_now(t0 + Duration::seconds(61));
    let decision = service.handle_request(&at_61, "reactions").await.unwrap();
    assert!(decision.allowed);
}

/// 平稳历史上的请求陡增触发 z-score 规则：risk=high、标记可疑、
/// 写 warning 级 anomaly_detected 审计事件
#[tokio::test]
async fn test_request_spike_flags_device() {
    let (service, stores) = service_with_stores();
    let now = Utc::now();

    // 先让设备存在
    let seed = RequestContext::new("device-spike").with_now(now - Duration::hours(24));
    service.handle_request(&seed, "listens").await.unwrap();

    // 此前 23 小时平稳活动（每小时 8~12 次），直接写活动日志
    for hour in 1..=23i64 {
        let count = if hour % 2 == 0 { 8 } else { 12 };
        for i in 0..count {
            stores
                .rate_limits
                .record(
                    ACTIVITY_LOG_KEY,
                    "device-spike",
                    now - Duration::hours(hour) - Duration::seconds(i),
                )
                .await
                .unwrap();
        }
    }
    // 当前小时陡增
    for i in 0..17i64 {
        stores
            .rate_limits
            .record(
                ACTIVITY_LOG_KEY,
                "device-spike",
                now - Duration::minutes(i + 1),
            )
            .await
            .unwrap();
    }

    // 这次请求顺带跑异常检测
    let ctx = RequestContext::new("device-spike").with_now(now);
    let decision = service.handle_request(&ctx, "listens").await.unwrap();
    assert!(decision.allowed, "异常检测只标记，不拒绝当次请求");

    let device = stores.devices.get("device-spike").await.unwrap().unwrap();
    assert!(device.is_suspicious);
    assert!(!device.is_revoked, "异常检测绝不自动吊销");

    let events = service
        .query_audit_log(&AuditQuery {
            device_id: Some("device-spike".to_string()),
            event_type: Some(AuditEventType::AnomalyDetected),
            ..AuditQuery::default()
        })
        .await
        .unwrap();
    assert!(!events.is_empty());
    assert_eq!(events[0].severity, Severity::Warning);
    assert_eq!(
        events[0].details["risk_level"],
        serde_json::json!(RiskLevel::High.as_str())
    );
}

/// 吊销优先于一切：高信任分、无可疑标记也照样拒绝
#[tokio::test]
async fn test_revocation_dominates_everything() {
    let (service, stores) = service_with_stores();
    let ctx = RequestContext::new("device-vip");

    service.handle_request(&ctx, "reactions").await.unwrap();
    service
        .revoke_device("device-vip", "chargeback fraud")
        .await
        .unwrap();

    let decision = service.is_device_allowed("device-vip").await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, "device_revoked");

    // 吊销不可逆：重复吊销保留首次原因
    service
        .revoke_device("device-vip", "second reason")
        .await
        .unwrap();
    let device = stores.devices.get("device-vip").await.unwrap().unwrap();
    assert_eq!(device.revoked_reason.as_deref(), Some("chargeback fraud"));

    let events = service
        .query_audit_log(&AuditQuery {
            event_type: Some(AuditEventType::DeviceRevoked),
            min_severity: Some(Severity::Critical),
            ..AuditQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(events.len(), 2);
}

/// 会话生命周期：初始化 → 有效 → 临近过期才续期 → 过期后拒绝
#[tokio::test]
async fn test_session_lifecycle() {
    let (service, stores) = service_with_stores();
    let now = Utc::now();
    let ctx = RequestContext::new("device-1").with_now(now);

    service.handle_request(&ctx, "reactions").await.unwrap();
    let expires_at = service.initialize_session("device-1", now).await.unwrap();
    assert_eq!(expires_at, now + Duration::hours(24));

    // 剩余 TTL 充足：请求不触发续期写入
    let mid = RequestContext::new("device-1").with_now(now + Duration::hours(2));
    service.handle_request(&mid, "reactions").await.unwrap();
    let device = stores.devices.get("device-1").await.unwrap().unwrap();
    assert_eq!(device.session_expires_at, Some(expires_at));

    // 剩余 30 分钟：续期生效
    let near = RequestContext::new("device-1")
        .with_now(now + Duration::hours(23) + Duration::minutes(30));
    service.handle_request(&near, "reactions").await.unwrap();
    let device = stores.devices.get("device-1").await.unwrap().unwrap();
    assert!(device.session_expires_at.unwrap() > expires_at);

    let refreshes = service
        .query_audit_log(&AuditQuery {
            event_type: Some(AuditEventType::SessionRefreshed),
            ..AuditQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(refreshes.len(), 1);
}

/// 并发首次接触：50 个任务同时 upsert 同一个新设备，
/// request_count 恰好为 50，且只有一行
#[tokio::test]
async fn test_concurrent_first_contact_no_lost_updates() {
    let (service, stores) = service_with_stores();

    let mut handles = Vec::new();
    for _ in 0..50 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .handle_request(&RequestContext::new("device-racy"), "listens")
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        let decision = handle.await.unwrap();
        assert!(decision.allowed);
    }

    let device = stores.devices.get("device-racy").await.unwrap().unwrap();
    assert_eq!(device.request_count, 50);
}

/// 保留期清理后信任分因子的数据来源仍然完整（活动日志保留 7 天）
#[tokio::test]
async fn test_retention_keeps_trust_inputs() {
    let (service, stores) = service_with_stores();
    let now = Utc::now();

    // 3 天前与 10 天前的活动
    for day in [3i64, 10] {
        stores
            .rate_limits
            .record(ACTIVITY_LOG_KEY, "device-1", now - Duration::days(day))
            .await
            .unwrap();
    }
    stores
        .devices
        .upsert_activity(&ActivityUpdate {
            device_id: "device-1".to_string(),
            ip: None,
            user_agent: None,
            geo: None,
            now,
        })
        .await
        .unwrap();

    service.run_retention_cycle(now).await.unwrap();

    let kept = stores
        .rate_limits
        .count_since(ACTIVITY_LOG_KEY, "device-1", now - Duration::days(30))
        .await
        .unwrap();
    // 10 天前的被清理，3 天前的保留
    assert_eq!(kept, 1);
}

/// 匿名请求（无设备令牌）一律拒绝
#[tokio::test]
async fn test_anonymous_denied() {
    let (service, _) = service_with_stores();
    let decision = service
        .handle_request(&RequestContext::anonymous(), "reactions")
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, "device_not_found");
}
