//! 统一日志系统初始化模块
//!
//! 控制台输出始终开启，配置了日志目录时额外写入按天滚动的文件。
//! 返回的guard由main持有，保证进程退出前日志落盘

use crate::cdcommon::config::LoggingConfig;
use crate::cdcommon::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// 初始化日志系统
///
/// 日志级别优先取RUST_LOG环境变量，否则使用配置值
pub fn init_logging(config: &LoggingConfig) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter_str = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| format!("{},hyper=warn,reqwest=warn,rusqlite=warn", config.log_level));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true);

    match &config.log_dir {
        Some(dir) if !dir.is_empty() => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, "candle_server.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);

            Registry::default()
                .with(EnvFilter::new(&filter_str))
                .with(console_layer)
                .with(file_layer)
                .init();
            Ok(Some(guard))
        }
        _ => {
            Registry::default()
                .with(EnvFilter::new(&filter_str))
                .with(console_layer)
                .init();
            Ok(None)
        }
    }
}
