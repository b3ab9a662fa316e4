//! 日志模块

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否启用文件日志
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 从配置文件的 log 段加载日志配置
    pub fn load(config_dir: &Path) -> Self {
        let config_file = config_dir.join("config.json");
        if config_file.exists() {
            if let Ok(content) = fs::read_to_string(&config_file) {
                if let Ok(config) = serde_json::from_str::<serde_json::Value>(&content) {
                    if let Some(log_config) = config.get("log") {
                        if let Ok(log) = serde_json::from_value::<LogConfig>(log_config.clone()) {
                            return log;
                        }
                    }
                }
            }
        }
        Self::default()
    }

    /// 配置的日志级别对应的 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 初始化日志系统
///
/// 文件日志按天滚动写入 `log_dir`；debug 构建同时输出到控制台。
/// 返回的 guard 在存活期间负责把缓冲日志刷到文件，调用方应持有它
/// 直到进程退出。重复初始化时返回 None。
pub fn init(config: &LogConfig, log_dir: &Path) -> Option<WorkerGuard> {
    if !config.enabled {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return None;
    }

    let env_filter = EnvFilter::from_default_env().add_directive(config.tracing_level().into());

    let _ = fs::create_dir_all(log_dir);
    let appender = tracing_appender::rolling::daily(log_dir, "modsync.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false);

    #[cfg(debug_assertions)]
    let result = {
        let console_layer = tracing_subscriber::fmt::layer().with_target(false);
        tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(console_layer),
        )
    };

    #[cfg(not(debug_assertions))]
    let result = tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(env_filter).with(file_layer),
    );

    if result.is_err() {
        // 已经有全局 subscriber（例如测试环境），保持原样
        return None;
    }
    Some(guard)
}
