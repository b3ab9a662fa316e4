//! 仓库连接描述

use serde::{Deserialize, Serialize};

/// 远程仓库连接信息
///
/// 由外部目录层提供，引擎只使用连接字段，不负责持久化。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Repository {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }

    /// 连接身份指纹
    ///
    /// 对 host:port:username 求稳定哈希，任一字段变化都会使
    /// 已有缓存失效。密码不参与计算。
    pub fn fingerprint(&self) -> String {
        let identity = format!("{}:{}:{}", self.host, self.port, self.username);
        let hash = blake3::hash(identity.as_bytes());
        hash.to_hex()[..16].to_string()
    }
}
