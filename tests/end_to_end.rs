mod common;

use anyhow::Result;
use chat_sync_backup::{BackupStatus, ImportMode, RelationalStore, SyncEvent, SyncService};
use common::{insert_conversations, Machine, RecordingSink, RecordingUi, CONVERSATION_SCHEMA};
use serde_json::json;
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

#[tokio::test]
async fn test_backup_then_increment_restore_into_empty_database() -> Result<()> {
    let root = tempdir()?;
    let sync_dir = root.path().join("sync");

    let source = Machine::new(root.path(), "source", &sync_dir, CONVERSATION_SCHEMA)?;
    insert_conversations(&source, 5)?;
    let source_service =
        SyncService::new(&source.config, source.settings.clone(), source.store.clone());
    let sink = Arc::new(RecordingSink::default());
    source_service.register_sink(sink.clone());

    assert!(source_service.list_backups()?.is_empty());

    let info = source_service
        .start_backup()
        .await?
        .expect("备份应当执行");
    let backups = source_service.list_backups()?;
    assert_eq!(backups.len(), 1);
    assert!(backups[0].size > 0);
    assert_eq!(backups[0], info);

    let status = source_service.get_backup_status();
    assert_eq!(status.status, BackupStatus::Idle);
    assert!(!status.is_backing_up);
    assert_eq!(status.last_sync_time, Some(info.created_at));
    assert_eq!(source.settings_json()?["lastSyncTime"], json!(info.created_at));

    let events = sink.snapshot();
    assert!(matches!(events.first(), Some(SyncEvent::BackupStarted { .. })));
    assert!(matches!(events.last(), Some(SyncEvent::BackupCompleted { .. })));

    // 另一台机器：只有表结构，没有数据
    let target = Machine::new(root.path(), "target", &sync_dir, CONVERSATION_SCHEMA)?;
    let target_service =
        SyncService::new(&target.config, target.settings.clone(), target.store.clone());
    let ui = Arc::new(RecordingUi::default());
    target_service.register_ui(ui.clone());

    let first = target_service
        .import_from_sync(&info.filename, ImportMode::Increment)
        .await;
    assert!(first.success, "{}", first.message);
    assert_eq!(first.affected_count, 5);
    assert_eq!(first.tables.get("conversations"), Some(&5));
    assert_eq!(target.count("conversations")?, 5);
    assert!(target.store.is_open());
    assert_eq!(ui.refresh_count(), 1);
    assert_eq!(ui.collapse_count(), 0, "增量恢复不应收起窗口");

    let second = target_service
        .import_from_sync(&info.filename, ImportMode::Increment)
        .await;
    assert!(second.success, "{}", second.message);
    assert_eq!(second.affected_count, 0, "重复导入不应插入任何行");
    assert_eq!(target.count("conversations")?, 5);
    Ok(())
}

#[tokio::test]
async fn test_overwrite_restore_keeps_local_sync_settings() -> Result<()> {
    let root = tempdir()?;
    let source_sync = root.path().join("sync-a");
    let target_sync = root.path().join("sync-b");

    let source = Machine::new(root.path(), "source", &source_sync, CONVERSATION_SCHEMA)?;
    insert_conversations(&source, 3)?;
    fs::write(
        &source.paths.custom_prompts,
        serde_json::to_vec(&json!({"prompts": [{"id": "p1", "content": "hi"}]}))?,
    )?;
    let source_service =
        SyncService::new(&source.config, source.settings.clone(), source.store.clone());
    let info = source_service.start_backup().await?.expect("备份应当执行");

    let target = Machine::new(root.path(), "target", &target_sync, CONVERSATION_SCHEMA)?;
    insert_conversations(&target, 7)?;
    let mut target_settings = target.settings_json()?;
    target_settings["lastSyncTime"] = json!(111);
    fs::write(&target.paths.settings, serde_json::to_vec(&target_settings)?)?;

    fs::create_dir_all(&target_sync)?;
    fs::copy(
        source_sync.join(&info.filename),
        target_sync.join(&info.filename),
    )?;

    let target_service =
        SyncService::new(&target.config, target.settings.clone(), target.store.clone());
    let ui = Arc::new(RecordingUi::default());
    target_service.register_ui(ui.clone());

    let outcome = target_service
        .import_from_sync(&info.filename, ImportMode::Overwrite)
        .await;
    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.affected_count, 3);
    assert_eq!(target.count("conversations")?, 3, "覆盖后应与备份一致");

    let settings = target.settings_json()?;
    assert_eq!(settings["theme"], "source", "其余设置来自备份");
    assert_eq!(settings["syncEnabled"], true);
    assert_eq!(settings["syncFolderPath"], json!(target_sync));
    assert_eq!(settings["lastSyncTime"], 111);

    let prompts: serde_json::Value =
        serde_json::from_slice(&fs::read(&target.paths.custom_prompts)?)?;
    assert_eq!(prompts["prompts"][0]["id"], "p1");

    assert_eq!(ui.refresh_count(), 1);
    assert_eq!(ui.collapse_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_increment_merges_prompts_and_registry() -> Result<()> {
    let root = tempdir()?;
    let sync_dir = root.path().join("sync");

    let source = Machine::new(root.path(), "source", &sync_dir, CONVERSATION_SCHEMA)?;
    fs::write(
        &source.paths.custom_prompts,
        serde_json::to_vec(&json!({"prompts": [{"id": 1}, {"id": 2}]}))?,
    )?;
    fs::write(
        &source.paths.mcp_settings,
        serde_json::to_vec(&json!({
            "mcpServers": {
                "weather": {"command": "weather-server"},
                "knowledge-base-x": {"command": "kb"},
                "notes": {"command": "/opt/knowledge/bin/notes"}
            },
            "defaultServers": ["weather", "knowledge-base-x"],
            "telemetry": {"enabled": false}
        }))?,
    )?;
    let source_service =
        SyncService::new(&source.config, source.settings.clone(), source.store.clone());
    let info = source_service.start_backup().await?.expect("备份应当执行");

    let target = Machine::new(root.path(), "target", &sync_dir, CONVERSATION_SCHEMA)?;
    fs::write(
        &target.paths.custom_prompts,
        serde_json::to_vec(&json!({"prompts": [{"id": 2, "local": true}, {"id": 3}]}))?,
    )?;
    let target_service =
        SyncService::new(&target.config, target.settings.clone(), target.store.clone());

    let outcome = target_service
        .import_from_sync(&info.filename, ImportMode::Increment)
        .await;
    assert!(outcome.success, "{}", outcome.message);

    let prompts: serde_json::Value =
        serde_json::from_slice(&fs::read(&target.paths.custom_prompts)?)?;
    let ids: Vec<i64> = prompts["prompts"]
        .as_array()
        .expect("prompts 应为数组")
        .iter()
        .filter_map(|p| p["id"].as_i64())
        .collect();
    assert_eq!(ids, vec![2, 3, 1]);
    assert_eq!(prompts["prompts"][0]["local"], true, "已有条目不应被修改");

    let registry: serde_json::Value =
        serde_json::from_slice(&fs::read(&target.paths.mcp_settings)?)?;
    assert!(registry["mcpServers"].get("weather").is_some());
    assert!(registry["mcpServers"].get("knowledge-base-x").is_none());
    assert!(registry["mcpServers"].get("notes").is_none());
    assert_eq!(registry["defaultServers"], json!(["weather"]));
    assert_eq!(registry["telemetry"], json!({"enabled": false}));

    // 1 条提示词 + 1 个服务器 + 1 个默认服务器 + 1 个顶层键
    assert_eq!(outcome.merged_entries, 4);
    Ok(())
}

#[tokio::test]
async fn test_backup_without_settings_file_fails_fast() -> Result<()> {
    let root = tempdir()?;
    let sync_dir = root.path().join("sync");
    let machine = Machine::new(root.path(), "solo", &sync_dir, CONVERSATION_SCHEMA)?;

    // 设置存储仍能读到配置，但在线设置文件已不在数据目录中
    let settings_copy = root.path().join("elsewhere.json");
    fs::rename(&machine.paths.settings, &settings_copy)?;
    let settings = Arc::new(chat_sync_backup::JsonSettingsStore::new(&settings_copy));

    let service = SyncService::new(&machine.config, settings, machine.store.clone());
    let err = service.start_backup().await.expect_err("缺少设置文件时应失败");
    assert_eq!(err.message_key(), "sync.error.nothingToBackup");
    assert!(service.list_backups()?.is_empty());
    assert_eq!(service.get_backup_status().status, BackupStatus::Idle);
    assert!(service.get_backup_status().last_error.is_some());
    Ok(())
}
