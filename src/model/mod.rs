//! 数据模型
//!
//! 四张持久化表的实体定义：设备、限流条目、审计事件、异常快照。

pub mod anomaly;
pub mod audit;
pub mod device;
pub mod rate_limit;

pub use anomaly::{AnomalyFeatures, AnomalySnapshot, RiskLevel};
pub use audit::{AuditEvent, AuditEventType, AuditQuery, Severity};
pub use device::{
    Device, DeviceSnapshot, GeoLocation, ObservationKind, SecurityStatus, TrustFactors,
};
pub use rate_limit::RateLimitDecision;
