//! 应用设置合并（覆盖模式）

use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{expect_object, read_json_document, write_json_document};
use crate::error::Result;
use crate::store::{setting_keys, SettingsStore};

/// 恢复前从设置存储读取的本机同步配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSyncSettings {
    pub sync_enabled: bool,
    pub sync_folder_path: Option<PathBuf>,
    pub last_sync_time: Option<i64>,
}

impl LiveSyncSettings {
    pub fn capture(store: &dyn SettingsStore) -> Self {
        Self {
            sync_enabled: store.is_sync_enabled(),
            sync_folder_path: store.sync_folder_path(),
            last_sync_time: store.last_sync_time(),
        }
    }
}

/// 以备份文档为基础，强制写回本机的三个同步键
///
/// 本机没有值的键会从结果中移除，避免沿用另一台机器的同步目录。
pub fn merge_settings(mut backup: Value, live: &LiveSyncSettings, label: &Path) -> Result<Value> {
    let obj = expect_object(&mut backup, label)?;

    obj.insert(
        setting_keys::SYNC_ENABLED.to_string(),
        Value::Bool(live.sync_enabled),
    );
    match &live.sync_folder_path {
        Some(path) => {
            obj.insert(
                setting_keys::SYNC_FOLDER_PATH.to_string(),
                Value::String(path.to_string_lossy().into_owned()),
            );
        }
        None => {
            obj.remove(setting_keys::SYNC_FOLDER_PATH);
        }
    }
    match live.last_sync_time {
        Some(ts) => {
            obj.insert(setting_keys::LAST_SYNC_TIME.to_string(), Value::from(ts));
        }
        None => {
            obj.remove(setting_keys::LAST_SYNC_TIME);
        }
    }
    Ok(backup)
}

/// 把备份设置合并后写到在线设置文件
pub fn apply_settings_file(backup_path: &Path, live_path: &Path, live: &LiveSyncSettings) -> Result<()> {
    let backup = read_json_document(backup_path)?;
    let merged = merge_settings(backup, live, backup_path)?;
    write_json_document(live_path, &merged)?;
    info!("[Merge] 应用设置已覆盖（保留本机同步配置）");
    Ok(())
}
