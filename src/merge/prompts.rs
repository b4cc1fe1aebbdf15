//! 提示词库合并（增量模式）
//!
//! 文档结构为 `{"prompts": [...]}`，按 `id` 精确匹配去重。

use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

use super::{expect_object, file_label, read_json_document, read_json_or, write_json_document};
use crate::error::{Result, SyncBackupError};

const PROMPTS_KEY: &str = "prompts";

fn prompt_list<'a>(doc: &'a Value, path: &Path) -> Result<&'a [Value]> {
    match doc.get(PROMPTS_KEY) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(SyncBackupError::merge(
            file_label(path),
            "\"prompts\" is not an array",
        )),
    }
}

/// 把备份中 `id` 不存在于目标的提示词追加到目标，返回新增数量
pub fn merge_prompt_documents(
    target: &mut Value,
    backup: &Value,
    target_path: &Path,
    backup_path: &Path,
) -> Result<usize> {
    if !backup.is_object() {
        return Err(SyncBackupError::merge(
            file_label(backup_path),
            "document is not a JSON object",
        ));
    }
    let incoming = prompt_list(backup, backup_path)?;

    let existing: HashSet<String> = prompt_list(target, target_path)?
        .iter()
        .filter_map(|p| p.get("id"))
        .map(Value::to_string)
        .collect();

    let mut additions = Vec::new();
    let mut seen = existing;
    for prompt in incoming {
        let Some(id) = prompt.get("id") else {
            warn!("[Merge] 跳过缺少 id 的提示词: {}", file_label(backup_path));
            continue;
        };
        if seen.insert(id.to_string()) {
            additions.push(prompt.clone());
        }
    }

    if additions.is_empty() {
        return Ok(0);
    }

    let added = additions.len();
    let obj = expect_object(target, target_path)?;
    match obj
        .entry(PROMPTS_KEY)
        .or_insert_with(|| Value::Array(Vec::new()))
    {
        Value::Array(items) => items.extend(additions),
        slot => *slot = Value::Array(additions),
    }
    Ok(added)
}

/// 合并提示词文件；只有新增数量大于 0 时才写入目标
pub fn merge_prompt_file(backup_path: &Path, target_path: &Path) -> Result<usize> {
    let backup = read_json_document(backup_path)?;
    let mut target = read_json_or(target_path, json!({ "prompts": [] }))?;

    let added = merge_prompt_documents(&mut target, &backup, target_path, backup_path)?;
    if added > 0 {
        write_json_document(target_path, &target)?;
        info!(
            "[Merge] {} 新增 {} 条提示词",
            file_label(target_path),
            added
        );
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn ids(doc: &Value) -> Vec<i64> {
        doc["prompts"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["id"].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn test_union_by_id_appends_only_missing() {
        let backup = json!({"prompts": [{"id": 1, "text": "b1"}, {"id": 2, "text": "b2"}]});
        let mut target = json!({"prompts": [{"id": 2, "text": "t2"}, {"id": 3, "text": "t3"}]});

        let added = merge_prompt_documents(
            &mut target,
            &backup,
            Path::new("custom_prompts.json"),
            Path::new("backup.json"),
        )
        .unwrap();

        assert_eq!(added, 1);
        let mut got = ids(&target);
        got.sort();
        assert_eq!(got, vec![1, 2, 3]);
        assert_eq!(target["prompts"][0]["text"], "t2", "已有提示词不应被修改");
    }

    #[test]
    fn test_string_and_number_ids_do_not_collide() {
        let backup = json!({"prompts": [{"id": "1"}]});
        let mut target = json!({"prompts": [{"id": 1}]});
        let added = merge_prompt_documents(
            &mut target,
            &backup,
            Path::new("t.json"),
            Path::new("b.json"),
        )
        .unwrap();
        assert_eq!(added, 1);
    }

    #[test]
    fn test_no_additions_leaves_target_file_untouched() {
        let dir = TempDir::new().unwrap();
        let backup = dir.path().join("backup.json");
        let target = dir.path().join("custom_prompts.json");
        fs::write(&backup, br#"{"prompts":[{"id":1}]}"#).unwrap();
        // 非规范格式：若被重写，字节会发生变化
        fs::write(&target, br#"{ "prompts" : [ {"id":1} ] }"#).unwrap();

        assert_eq!(merge_prompt_file(&backup, &target).unwrap(), 0);
        assert_eq!(
            fs::read(&target).unwrap(),
            br#"{ "prompts" : [ {"id":1} ] }"#.to_vec()
        );
    }

    #[test]
    fn test_missing_target_is_created() {
        let dir = TempDir::new().unwrap();
        let backup = dir.path().join("backup.json");
        let target = dir.path().join("system_prompts.json");
        fs::write(&backup, br#"{"prompts":[{"id":"a"},{"id":"b"}]}"#).unwrap();

        assert_eq!(merge_prompt_file(&backup, &target).unwrap(), 2);
        let doc: Value = serde_json::from_slice(&fs::read(&target).unwrap()).unwrap();
        assert_eq!(doc["prompts"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_backup_is_fatal() {
        let dir = TempDir::new().unwrap();
        let backup = dir.path().join("backup.json");
        fs::write(&backup, b"[[[").unwrap();
        let result = merge_prompt_file(&backup, &dir.path().join("t.json"));
        assert!(matches!(result, Err(SyncBackupError::Merge { .. })));
    }
}
