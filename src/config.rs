//! 引擎配置
//!
//! 加载顺序：`.env` → `config/chat_sync.toml`（如存在）→ `CHAT_SYNC__*` 环境变量。
//! 任一来源解析失败时回退到默认值并记录警告，不阻断启动。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const CONFIG_FILE_STEM: &str = "config/chat_sync";

fn default_app_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("chat-sync")
}

fn default_database_file() -> String {
    "chat.db".to_string()
}

fn default_settings_file() -> String {
    "app-settings.json".to_string()
}

fn default_custom_prompts_file() -> String {
    "custom_prompts.json".to_string()
}

fn default_system_prompts_file() -> String {
    "system_prompts.json".to_string()
}

fn default_mcp_settings_file() -> String {
    "mcp-settings.json".to_string()
}

fn default_debounce_secs() -> u64 {
    60
}

/// 引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 应用数据目录（数据库与各 JSON 配置文件所在位置）
    #[serde(default = "default_app_data_dir")]
    pub app_data_dir: PathBuf,
    #[serde(default = "default_database_file")]
    pub database_file: String,
    #[serde(default = "default_settings_file")]
    pub settings_file: String,
    #[serde(default = "default_custom_prompts_file")]
    pub custom_prompts_file: String,
    #[serde(default = "default_system_prompts_file")]
    pub system_prompts_file: String,
    #[serde(default = "default_mcp_settings_file")]
    pub mcp_settings_file: String,
    /// 防抖窗口（秒）
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    /// 恢复会话临时目录的父目录，缺省使用系统临时目录
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// 保留的最大备份数量，缺省不清理
    #[serde(default)]
    pub max_backups: Option<usize>,
    /// 已加密数据库的密钥（仅在启用加密的 SQLite 构建下生效）
    #[serde(default, skip_serializing)]
    pub database_key: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_data_dir: default_app_data_dir(),
            database_file: default_database_file(),
            settings_file: default_settings_file(),
            custom_prompts_file: default_custom_prompts_file(),
            system_prompts_file: default_system_prompts_file(),
            mcp_settings_file: default_mcp_settings_file(),
            debounce_secs: default_debounce_secs(),
            work_dir: None,
            max_backups: None,
            database_key: None,
        }
    }
}

impl EngineConfig {
    /// 以指定数据目录构造，其余字段取默认值
    pub fn with_app_data_dir(app_data_dir: impl Into<PathBuf>) -> Self {
        Self {
            app_data_dir: app_data_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_env_and_file() -> Self {
        dotenvy::dotenv().ok();
        let mut builder = config::Config::builder();
        if Path::new(&format!("{}.toml", CONFIG_FILE_STEM)).exists() {
            builder = builder.add_source(config::File::with_name(CONFIG_FILE_STEM));
        }
        builder = builder.add_source(config::Environment::with_prefix("CHAT_SYNC").separator("__"));

        match builder.build() {
            Ok(loaded) => match loaded.try_deserialize::<EngineConfig>() {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!("[Config] 配置反序列化失败，使用默认值: {}", e);
                    EngineConfig::default()
                }
            },
            Err(e) => {
                warn!("[Config] 配置加载失败，使用默认值: {}", e);
                EngineConfig::default()
            }
        }
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn live_paths(&self) -> LivePaths {
        LivePaths {
            database: self.app_data_dir.join(&self.database_file),
            settings: self.app_data_dir.join(&self.settings_file),
            custom_prompts: self.app_data_dir.join(&self.custom_prompts_file),
            system_prompts: self.app_data_dir.join(&self.system_prompts_file),
            mcp_settings: self.app_data_dir.join(&self.mcp_settings_file),
        }
    }
}

/// 备份/恢复涉及的所有在线文件路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePaths {
    pub database: PathBuf,
    pub settings: PathBuf,
    pub custom_prompts: PathBuf,
    pub system_prompts: PathBuf,
    pub mcp_settings: PathBuf,
}

impl LivePaths {
    /// 恢复过程中可能被修改的全部文件（含数据库 WAL/SHM 辅助文件）
    pub fn restorable_files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.database.clone()];
        files.extend(crate::backup_common::sqlite_aux_paths(&self.database));
        files.push(self.settings.clone());
        files.push(self.custom_prompts.clone());
        files.push(self.system_prompts.clone());
        files.push(self.mcp_settings.clone());
        files
    }
}
