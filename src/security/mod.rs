//! 安全子系统核心组件
//!
//! 各组件只通过存储 trait 交互，彼此之间不共享可变状态：
//! - `registry`：设备登记与生命周期（原子 upsert、吊销、认证失败）
//! - `rate_limiter`：滑动窗口限流
//! - `session`：会话初始化 / 校验 / 按需续期
//! - `trust`：信任评分引擎（加权因子，慢变化）
//! - `anomaly`：异常检测器（阈值规则，快反应）
//! - `audit`：仅追加的审计事件流
//! - `service`：对外统一入口，编排固定的请求检查顺序
//!
//! 失败语义是 fail-closed：任一安全检查因存储故障无法完成时，
//! 请求被拒绝并返回可重试的 `storage_unavailable`，绝不放行。

pub mod anomaly;
pub mod audit;
pub mod rate_limiter;
pub mod registry;
pub mod service;
pub mod session;
pub mod trust;

/// 设备活动日志在限流存储中占用的专用 key
///
/// 普通限流 key 只保留 24 小时，该 key 保留 7 天，
/// 是信任分"近 7 天请求数"因子和异常特征提取的数据来源。
pub const ACTIVITY_LOG_KEY: &str = "__activity";

pub use anomaly::AnomalyDetector;
pub use audit::AuditLog;
pub use rate_limiter::SlidingWindowRateLimiter;
pub use registry::DeviceRegistry;
pub use service::{AccessDecision, SecurityService, SecurityStores};
pub use session::{SessionManager, SessionState};
pub use trust::{TrustInputs, TrustScoringEngine};
