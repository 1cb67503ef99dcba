// 导出模块
pub mod cdcommon;
pub mod cddata;

// Re-export error types
pub use cdcommon::error::AppError;
