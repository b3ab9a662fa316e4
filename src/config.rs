//! 引擎配置模块

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 同步引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// 同时进行的目录列表操作数
    #[serde(default = "default_scan_concurrency")]
    pub max_concurrent_scans: usize,
    /// 同时进行的文件下载数（与扫描预算相互独立）
    #[serde(default = "default_transfer_concurrency")]
    pub max_concurrent_transfers: usize,
    /// 快照缓存有效期（秒）
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_scan_concurrency() -> usize {
    8
}

fn default_transfer_concurrency() -> usize {
    8
}

fn default_cache_ttl() -> u64 {
    3600 // 默认 1 小时
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_scans: default_scan_concurrency(),
            max_concurrent_transfers: default_transfer_concurrency(),
            cache_ttl_secs: default_cache_ttl(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl EngineConfig {
    /// 从配置文件加载引擎配置
    pub fn load(config_dir: &Path) -> Self {
        let config_file = config_dir.join("config.json");
        if config_file.exists() {
            if let Ok(content) = fs::read_to_string(&config_file) {
                if let Ok(config) = serde_json::from_str::<serde_json::Value>(&content) {
                    if let Some(engine) = config.get("engine") {
                        if let Ok(parsed) = serde_json::from_value::<EngineConfig>(engine.clone())
                        {
                            return parsed;
                        }
                    }
                }
            }
        }
        Self::default()
    }

    /// 保存引擎配置，保留文件中的其他配置段
    pub fn save(&self, config_dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(config_dir)?;
        let config_file = config_dir.join("config.json");

        let mut config: serde_json::Value = if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };

        config["engine"] = serde_json::to_value(self)?;
        fs::write(&config_file, serde_json::to_string_pretty(&config)?)?;

        Ok(())
    }
}
