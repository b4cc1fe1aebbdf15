//! 集成服务器注册表合并（增量模式）
//!
//! 文档结构：`{"mcpServers": {<name>: {"command": ..., ...}}, "defaultServers": [<name>, ...], ...}`
//!
//! - 服务器按名称合并，目标已有同名服务器时不覆盖
//! - 名称或启动命令包含 `knowledge` 的服务器一律不导入（它们内嵌本机文件路径）
//! - 默认服务器名单按同样的排除规则取并集
//! - 目标中不存在的其它顶层键原样复制

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::Path;
use tracing::{debug, info};

use super::{expect_object, file_label, read_json_document, read_json_or, write_json_document};
use crate::error::{Result, SyncBackupError};

pub const SERVERS_KEY: &str = "mcpServers";
pub const DEFAULT_SERVERS_KEY: &str = "defaultServers";

/// 标识 knowledge 类集成的子串（大小写敏感）
pub const KNOWLEDGE_MARKER: &str = "knowledge";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryMergeReport {
    pub servers_added: usize,
    pub defaults_added: usize,
    pub keys_copied: usize,
}

impl RegistryMergeReport {
    pub fn total(&self) -> usize {
        self.servers_added + self.defaults_added + self.keys_copied
    }
}

pub fn is_knowledge_server(name: &str, definition: &Value) -> bool {
    name.contains(KNOWLEDGE_MARKER)
        || definition
            .get("command")
            .and_then(Value::as_str)
            .map(|cmd| cmd.contains(KNOWLEDGE_MARKER))
            .unwrap_or(false)
}

fn object_field<'a>(doc: &'a Value, key: &str, path: &Path) -> Result<Option<&'a Map<String, Value>>> {
    match doc.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(SyncBackupError::merge(
            file_label(path),
            format!("\"{}\" is not an object", key),
        )),
    }
}

fn string_list(doc: &Value, key: &str, path: &Path) -> Result<Vec<String>> {
    match doc.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()),
        Some(_) => Err(SyncBackupError::merge(
            file_label(path),
            format!("\"{}\" is not an array", key),
        )),
    }
}

pub fn merge_registry_documents(
    target: &mut Value,
    backup: &Value,
    target_path: &Path,
    backup_path: &Path,
) -> Result<RegistryMergeReport> {
    if !backup.is_object() {
        return Err(SyncBackupError::merge(
            file_label(backup_path),
            "document is not a JSON object",
        ));
    }
    let backup_servers = object_field(backup, SERVERS_KEY, backup_path)?;
    let backup_defaults = string_list(backup, DEFAULT_SERVERS_KEY, backup_path)?;
    // 先校验目标结构，再做任何修改
    object_field(target, SERVERS_KEY, target_path)?;
    let mut target_defaults = string_list(target, DEFAULT_SERVERS_KEY, target_path)?;

    let mut report = RegistryMergeReport::default();
    let obj = expect_object(target, target_path)?;

    if let Some(servers) = backup_servers {
        let mut additions = Vec::new();
        {
            let existing = obj.get(SERVERS_KEY).and_then(Value::as_object);
            for (name, definition) in servers {
                if is_knowledge_server(name, definition) {
                    debug!("[Merge] 跳过 knowledge 类集成: {}", name);
                    continue;
                }
                if existing.map(|m| m.contains_key(name)).unwrap_or(false) {
                    continue;
                }
                additions.push((name.clone(), definition.clone()));
            }
        }
        if !additions.is_empty() {
            let slot = obj
                .entry(SERVERS_KEY)
                .or_insert_with(|| Value::Object(Map::new()));
            if slot.is_null() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(map) = slot {
                report.servers_added = additions.len();
                map.extend(additions);
            }
        }
    }

    let mut defaults_changed = false;
    for name in backup_defaults {
        if name.contains(KNOWLEDGE_MARKER) || target_defaults.contains(&name) {
            continue;
        }
        target_defaults.push(name);
        report.defaults_added += 1;
        defaults_changed = true;
    }
    if defaults_changed {
        obj.insert(DEFAULT_SERVERS_KEY.to_string(), json!(target_defaults));
    }

    if let Some(backup_obj) = backup.as_object() {
        for (key, value) in backup_obj {
            if key == SERVERS_KEY || key == DEFAULT_SERVERS_KEY || obj.contains_key(key) {
                continue;
            }
            obj.insert(key.clone(), value.clone());
            report.keys_copied += 1;
        }
    }

    Ok(report)
}

/// 合并注册表文件；有变化时才写入目标
pub fn merge_registry_file(backup_path: &Path, target_path: &Path) -> Result<RegistryMergeReport> {
    let backup = read_json_document(backup_path)?;
    let mut target = read_json_or(target_path, json!({ "mcpServers": {} }))?;

    let report = merge_registry_documents(&mut target, &backup, target_path, backup_path)?;
    if report.total() > 0 {
        write_json_document(target_path, &target)?;
        info!(
            "[Merge] 注册表新增 {} 个服务器、{} 个默认项、{} 个其它键",
            report.servers_added, report.defaults_added, report.keys_copied
        );
    }
    Ok(report)
}
