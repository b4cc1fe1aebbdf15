#![allow(dead_code)]

use anyhow::Result;
use chat_sync_backup::events::{EventSink, SyncEvent, UiHost};
use chat_sync_backup::{EngineConfig, JsonSettingsStore, LivePaths, SqliteStore};
use rusqlite::Connection;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// 一台“机器”：数据目录 + 同步目录 + 在线存储
pub struct Machine {
    pub config: EngineConfig,
    pub paths: LivePaths,
    pub sync_dir: PathBuf,
    pub settings: Arc<JsonSettingsStore>,
    pub store: Arc<SqliteStore>,
}

impl Machine {
    /// 建立数据目录，写入启用同步的设置文件，并用 `schema` 初始化数据库
    pub fn new(root: &Path, name: &str, sync_dir: &Path, schema: &str) -> Result<Self> {
        let app_dir = root.join(name);
        fs::create_dir_all(&app_dir)?;
        let mut config = EngineConfig::with_app_data_dir(&app_dir);
        config.work_dir = Some(root.join(format!("{}-work", name)));
        let paths = config.live_paths();

        fs::write(
            &paths.settings,
            serde_json::to_vec_pretty(&json!({
                "syncEnabled": true,
                "syncFolderPath": sync_dir,
                "theme": name,
            }))?,
        )?;

        let store = Arc::new(SqliteStore::open(&paths.database, None)?);
        store.with_connection(|c| c.execute_batch(schema))?;
        let settings = Arc::new(JsonSettingsStore::new(&paths.settings));

        Ok(Self {
            config,
            paths,
            sync_dir: sync_dir.to_path_buf(),
            settings,
            store,
        })
    }

    pub fn count(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        Ok(self.store.with_connection(|c| c.query_row(&sql, [], |r| r.get(0)))?)
    }

    pub fn settings_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&fs::read(&self.paths.settings)?)?)
    }
}

pub const CONVERSATION_SCHEMA: &str = "
    CREATE TABLE conversations (id TEXT PRIMARY KEY, title TEXT NOT NULL, created_at INTEGER);
    CREATE TABLE messages (
        id INTEGER PRIMARY KEY,
        conversation_id TEXT NOT NULL,
        content TEXT
    );
";

pub fn insert_conversations(machine: &Machine, count: usize) -> Result<()> {
    machine.store.with_connection(|c| {
        for i in 0..count {
            c.execute(
                "INSERT INTO conversations (id, title, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![format!("conv-{}", i), format!("对话 {}", i), i as i64],
            )?;
        }
        Ok(())
    })?;
    Ok(())
}

/// 在任意位置生成一个独立的 SQLite 文件并返回其字节
pub fn sqlite_bytes(dir: &Path, schema: &str, rows: &[(&str, &str)]) -> Result<Vec<u8>> {
    let path = dir.join(format!("scratch-{}.db", uuid::Uuid::new_v4()));
    {
        let conn = Connection::open(&path)?;
        conn.execute_batch(schema)?;
        for (id, title) in rows {
            conn.execute(
                "INSERT INTO conversations (id, title) VALUES (?1, ?2)",
                [id, title],
            )?;
        }
    }
    Ok(fs::read(&path)?)
}

/// 读取若干文件的当前字节，不存在的记为 None
pub fn capture_files(files: &[&Path]) -> Vec<Option<Vec<u8>>> {
    files.iter().map(|p| fs::read(p).ok()).collect()
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<SyncEvent>>,
}

impl RecordingSink {
    pub fn snapshot(&self) -> Vec<SyncEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &SyncEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[derive(Default)]
pub struct RecordingUi {
    pub refreshes: AtomicUsize,
    pub collapses: AtomicUsize,
    pub revealed: Mutex<Vec<PathBuf>>,
}

impl RecordingUi {
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn collapse_count(&self) -> usize {
        self.collapses.load(Ordering::SeqCst)
    }
}

impl UiHost for RecordingUi {
    fn refresh_sessions(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }

    fn collapse_windows(&self) {
        self.collapses.fetch_add(1, Ordering::SeqCst);
    }

    fn reveal_folder(&self, path: &Path) -> chat_sync_backup::Result<()> {
        if let Ok(mut revealed) = self.revealed.lock() {
            revealed.push(path.to_path_buf());
        }
        Ok(())
    }
}
