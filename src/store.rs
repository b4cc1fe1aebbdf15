//! 外部协作者：设置存储与关系库句柄
//!
//! 引擎只依赖 [`SettingsStore`] 与 [`RelationalStore`] 两个 trait，
//! 这里同时提供基于文件的默认实现：
//! - [`JsonSettingsStore`]：直接读写在线 `app-settings.json`
//! - [`SqliteStore`]：单连接的 SQLite 句柄，可关闭/重新打开

use rusqlite::Connection;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backup_common::{safe_lock, write_atomic};
use crate::error::{Result, SyncBackupError};

/// 设置中的同步相关键
pub mod setting_keys {
    pub const SYNC_ENABLED: &str = "syncEnabled";
    pub const SYNC_FOLDER_PATH: &str = "syncFolderPath";
    pub const LAST_SYNC_TIME: &str = "lastSyncTime";
}

/// 设置存储
pub trait SettingsStore: Send + Sync {
    fn is_sync_enabled(&self) -> bool;
    fn sync_folder_path(&self) -> Option<PathBuf>;
    /// 上次同步时间（Unix 毫秒）
    fn last_sync_time(&self) -> Option<i64>;
    fn set_last_sync_time(&self, timestamp: i64) -> Result<()>;
}

/// 关系库句柄
///
/// 同一时刻只有一个活动连接；恢复期间会被关闭，结束后重新打开。
pub trait RelationalStore: Send + Sync {
    fn close(&self) -> Result<()>;
    fn reopen(&self) -> Result<()>;
    fn is_open(&self) -> bool;

    /// 把 WAL 合并进主库文件，默认什么也不做
    fn checkpoint(&self) -> Result<()> {
        Ok(())
    }
}

/// 打开 SQLite 连接；提供密钥时先执行 `PRAGMA key`
pub fn open_sqlite(path: &Path, key: Option<&str>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    if let Some(key) = key {
        conn.pragma_update(None, "key", key)?;
    }
    Ok(conn)
}

// ============================================================================
// JsonSettingsStore
// ============================================================================

/// 基于 `app-settings.json` 的设置存储
///
/// 每次调用都重新读取文件，因此覆盖恢复后无需额外刷新。
pub struct JsonSettingsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Map<String, Value> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(_) => return Map::new(),
        };
        match serde_json::from_slice::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                warn!("[Settings] {:?} 不是 JSON 对象，按空设置处理", self.path);
                Map::new()
            }
            Err(e) => {
                warn!("[Settings] 解析 {:?} 失败，按空设置处理: {}", self.path, e);
                Map::new()
            }
        }
    }

    /// 更新单个键，其余键原样保留
    pub fn set_value(&self, key: &str, value: Value) -> Result<()> {
        let _guard = safe_lock(&self.write_lock);
        let mut doc = self.read_document();
        doc.insert(key.to_string(), value);
        write_atomic(&self.path, &serde_json::to_vec_pretty(&Value::Object(doc))?)?;
        Ok(())
    }
}

impl SettingsStore for JsonSettingsStore {
    fn is_sync_enabled(&self) -> bool {
        self.read_document()
            .get(setting_keys::SYNC_ENABLED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn sync_folder_path(&self) -> Option<PathBuf> {
        self.read_document()
            .get(setting_keys::SYNC_FOLDER_PATH)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
    }

    fn last_sync_time(&self) -> Option<i64> {
        self.read_document()
            .get(setting_keys::LAST_SYNC_TIME)
            .and_then(Value::as_i64)
    }

    fn set_last_sync_time(&self, timestamp: i64) -> Result<()> {
        self.set_value(setting_keys::LAST_SYNC_TIME, Value::from(timestamp))
    }
}

// ============================================================================
// SqliteStore
// ============================================================================

/// 单连接 SQLite 句柄
pub struct SqliteStore {
    path: PathBuf,
    key: Option<String>,
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl Into<PathBuf>, key: Option<String>) -> Result<Self> {
        let path = path.into();
        let conn = Self::connect(&path, key.as_deref())?;
        Ok(Self {
            path,
            key,
            conn: Mutex::new(Some(conn)),
        })
    }

    fn connect(path: &Path, key: Option<&str>) -> Result<Connection> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = open_sqlite(path, key)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!("[SqliteStore] journal_mode = {}", mode);
        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 在活动连接上执行操作；连接已关闭时返回错误
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let guard = safe_lock(&self.conn);
        match guard.as_ref() {
            Some(conn) => Ok(f(conn)?),
            None => Err(SyncBackupError::Store("connection is closed".to_string())),
        }
    }
}

impl RelationalStore for SqliteStore {
    fn close(&self) -> Result<()> {
        let mut guard = safe_lock(&self.conn);
        if let Some(conn) = guard.take() {
            if let Err((conn, e)) = conn.close() {
                *guard = Some(conn);
                return Err(e.into());
            }
            info!("[SqliteStore] 连接已关闭: {:?}", self.path);
        }
        Ok(())
    }

    fn reopen(&self) -> Result<()> {
        let mut guard = safe_lock(&self.conn);
        if guard.is_some() {
            debug!("[SqliteStore] 连接已处于打开状态");
            return Ok(());
        }
        *guard = Some(Self::connect(&self.path, self.key.as_deref())?);
        info!("[SqliteStore] 连接已重新打开: {:?}", self.path);
        Ok(())
    }

    fn is_open(&self) -> bool {
        safe_lock(&self.conn).is_some()
    }

    fn checkpoint(&self) -> Result<()> {
        let (busy, log_frames, checkpointed) = self.with_connection(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
            })
        })?;
        if busy != 0 {
            warn!(
                "[SqliteStore] checkpoint 未完成 (log={}, checkpointed={})",
                log_frames, checkpointed
            );
        }
        Ok(())
    }
}
