//! 审计日志
//!
//! 对仅追加的事件存储做一层薄封装：统一生成 event_id 与时间戳，
//! 并按严重级别输出结构化日志。事件一经写入不可修改，只有
//! 保留期清理会删除历史。

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{AuditEvent, AuditEventType, AuditQuery, Severity};
use crate::store::AuditStore;

/// 审计日志
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// 追加一条审计事件
    pub async fn append(
        &self,
        device_id: &str,
        profile_id: Option<&str>,
        event_type: AuditEventType,
        severity: Severity,
        details: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<AuditEvent> {
        let event = AuditEvent {
            event_id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            profile_id: profile_id.map(|s| s.to_string()),
            event_type,
            details,
            severity,
            created_at: now,
        };

        self.store.append(&event).await?;

        match severity {
            Severity::Info => {
                debug!("📋 审计事件: {} device={}", event_type.as_str(), device_id)
            }
            Severity::Warning => {
                warn!("⚠️ 审计事件: {} device={}", event_type.as_str(), device_id)
            }
            Severity::Error | Severity::Critical => {
                error!("❌ 审计事件: {} device={}", event_type.as_str(), device_id)
            }
        }

        Ok(event)
    }

    /// 按条件查询（时间倒序）
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        self.store.query(query).await
    }

    /// 清理超过保留期的事件，返回清理数量
    pub async fn purge_expired(&self, retention_days: i64, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - Duration::days(retention_days);
        let purged = self.store.purge_older_than(cutoff).await?;
        if purged > 0 {
            debug!("📋 审计保留期清理: 删除 {} 条事件", purged);
        }
        Ok(purged)
    }
}
