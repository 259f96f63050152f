use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化日志系统
///
/// 子系统以库形式被宿主服务引用，宿主已有 subscriber 时不要调用。
pub fn init_logging(log_level: &str, log_format: Option<&str>) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    match log_format {
        Some("json") => {
            // JSON 格式（适合生产环境）
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .init();
        }
        Some("pretty") | Some("dev") => {
            // Pretty 格式（适合开发环境）
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .init();
        }
        _ => {
            // Compact 格式（默认）
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact())
                .init();
        }
    }

    Ok(())
}
