//! 配置文件合并
//!
//! | 合并器 | 使用模式 | 语义 |
//! |-------|---------|------|
//! | [`settings`] | 覆盖 | 以备份为准，但保留本机的同步开关/同步目录/上次同步时间 |
//! | [`prompts`] | 增量 | 按 `id` 并集，只追加不修改 |
//! | [`registry`] | 增量 | 按服务器名并集，排除 knowledge 类集成，未知顶层键透传 |
//!
//! 备份中的 JSON 无法解析时视为致命错误，由恢复引擎回滚。

pub mod prompts;
pub mod registry;
pub mod settings;

use serde_json::Value;
use std::fs;
use std::path::Path;

use crate::backup_common::write_atomic;
use crate::error::{Result, SyncBackupError};

pub use prompts::merge_prompt_file;
pub use registry::{merge_registry_file, RegistryMergeReport};
pub use settings::{apply_settings_file, LiveSyncSettings};

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// 读取并解析 JSON 文档，解析失败映射为合并错误
pub(crate) fn read_json_document(path: &Path) -> Result<Value> {
    let raw = fs::read(path)?;
    serde_json::from_slice(&raw)
        .map_err(|e| SyncBackupError::merge(file_label(path), e.to_string()))
}

/// 同 [`read_json_document`]，文件不存在时返回 `default`
pub(crate) fn read_json_or(path: &Path, default: Value) -> Result<Value> {
    if !path.exists() {
        return Ok(default);
    }
    read_json_document(path)
}

pub(crate) fn write_json_document(path: &Path, doc: &Value) -> Result<()> {
    write_atomic(path, &serde_json::to_vec_pretty(doc)?)?;
    Ok(())
}

pub(crate) fn expect_object<'a>(
    doc: &'a mut Value,
    path: &Path,
) -> Result<&'a mut serde_json::Map<String, Value>> {
    doc.as_object_mut()
        .ok_or_else(|| SyncBackupError::merge(file_label(path), "document is not a JSON object"))
}
