//! 从同步目录恢复备份
//!
//! ## 流程
//! 1. 取消待执行的定时备份（由调用方注入的取消回调完成）
//! 2. 校验文件名 `backup-<digits>.zip`，只在同步目录内解析
//! 3. 解压到临时会话目录，检查数据库与设置条目存在，校验清单
//! 4. 关闭关系库连接
//! 5. 为所有可能被修改的在线文件做快照（不存在的记为 absent）
//! 6. 按模式分派：覆盖 / 增量
//! 7. 重新打开关系库连接
//! 8. 通知界面刷新会话列表
//! 9. 覆盖模式下额外收起所有窗口
//!
//! 第 4 到 9 步任何失败都会把快照写回原位置、重新打开连接并再次刷新，
//! 在线数据保持调用前的状态。临时会话目录在所有退出路径上都会被删除。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::archive::{entry_paths, extract_archive, ExtractedArchive};
use crate::backup_common::{
    remove_sqlite_aux_files, resilient_copy_file, resilient_remove_file, OperationLimiter,
};
use crate::builder::is_backup_file_name;
use crate::config::{EngineConfig, LivePaths};
use crate::error::{Result, SyncBackupError};
use crate::events::{Notifier, SyncEvent};
use crate::manifest::BackupManifest;
use crate::merge::{apply_settings_file, merge_prompt_file, merge_registry_file, LiveSyncSettings};
use crate::store::{open_sqlite, RelationalStore, SettingsStore};
use crate::table_import::{count_user_rows, import_database_file};

/// 恢复模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    /// 整体替换在线数据
    Overwrite,
    /// 与在线数据合并，只补充缺失的行与条目
    Increment,
}

impl ImportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportMode::Overwrite => "overwrite",
            ImportMode::Increment => "increment",
        }
    }
}

impl FromStr for ImportMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(ImportMode::Overwrite),
            "increment" => Ok(ImportMode::Increment),
            other => Err(format!("unknown import mode: {}", other)),
        }
    }
}

/// `import_from_sync` 的返回值，失败也通过它表达
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_key: Option<String>,
    /// 覆盖：备份库业务表行数总和；增量：新插入的行数
    pub affected_count: usize,
    /// 增量模式下每张表新插入的行数
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tables: BTreeMap<String, usize>,
    /// 合并或替换的配置条目数
    pub merged_entries: usize,
}

impl ImportOutcome {
    fn failed(err: &SyncBackupError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            message_key: Some(err.message_key().to_string()),
            affected_count: 0,
            tables: BTreeMap::new(),
            merged_entries: 0,
        }
    }
}

#[derive(Debug, Default)]
struct RestoreReport {
    affected_count: usize,
    tables: BTreeMap<String, usize>,
    merged_entries: usize,
}

/// 校验备份文件名并解析为同步目录下的路径
///
/// 只接受 `backup-<digits>.zip` 这样的裸文件名，任何目录成分都会被拒绝。
pub fn resolve_backup_path(folder: &Path, filename: &str) -> Result<PathBuf> {
    if !is_backup_file_name(filename) {
        return Err(SyncBackupError::InvalidFilename(filename.to_string()));
    }
    let path = folder.join(filename);
    if path.parent() != Some(folder) {
        return Err(SyncBackupError::InvalidFilename(filename.to_string()));
    }
    if !path.is_file() {
        return Err(SyncBackupError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("backup not found: {}", filename),
        )));
    }
    Ok(path)
}

// ============================================================================
// StoreGuard
// ============================================================================

/// 关系库关闭/重开守卫
///
/// 构造时关闭连接；若直到析构都没有成功重开，析构时再尝试一次。
pub struct StoreGuard<'a> {
    store: &'a dyn RelationalStore,
    open: bool,
}

impl<'a> StoreGuard<'a> {
    pub fn enter(store: &'a dyn RelationalStore) -> Result<Self> {
        store.close()?;
        info!("[StoreGuard] 关系库连接已关闭");
        Ok(Self { store, open: false })
    }

    pub fn reopen(&mut self) -> Result<()> {
        self.store.reopen()?;
        self.open = true;
        Ok(())
    }

    /// 回滚前确保连接已关闭
    pub fn ensure_closed(&mut self) -> Result<()> {
        if self.open {
            self.store.close()?;
            self.open = false;
        }
        Ok(())
    }
}

impl Drop for StoreGuard<'_> {
    fn drop(&mut self) {
        if self.open {
            return;
        }
        match self.store.reopen() {
            Ok(()) => info!("[StoreGuard] 关系库连接已在退出时重新打开"),
            Err(e) => error!("[StoreGuard] 退出时重新打开关系库失败: {}", e),
        }
    }
}

// ============================================================================
// SnapshotSet
// ============================================================================

#[derive(Debug)]
enum Snapshot {
    Present { live: PathBuf, copy: PathBuf },
    Absent { live: PathBuf },
}

/// 恢复前的在线文件快照
#[derive(Debug)]
pub struct SnapshotSet {
    entries: Vec<Snapshot>,
}

impl SnapshotSet {
    /// 把 `files` 中存在的文件复制到 `dir`
    pub fn capture(files: &[PathBuf], dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut entries = Vec::with_capacity(files.len());
        for (idx, live) in files.iter().enumerate() {
            if live.is_file() {
                let name = live
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let copy = dir.join(format!("{}-{}", idx, name));
                resilient_copy_file(live, &copy)?;
                debug!("[Restore] 已快照 {:?}", live);
                entries.push(Snapshot::Present {
                    live: live.clone(),
                    copy,
                });
            } else {
                entries.push(Snapshot::Absent { live: live.clone() });
            }
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 把所有快照写回原位置，absent 的文件若被创建则删除
    ///
    /// 单个文件失败不会中断其余文件的恢复，返回第一个错误。
    pub fn restore_all(&self) -> Result<usize> {
        let mut restored = 0usize;
        let mut first_err: Option<SyncBackupError> = None;

        for entry in &self.entries {
            let outcome = match entry {
                Snapshot::Present { live, copy } => resilient_copy_file(copy, live).map(|_| ()),
                Snapshot::Absent { live } => resilient_remove_file(live),
            };
            match outcome {
                Ok(()) => restored += 1,
                Err(e) => {
                    let live = match entry {
                        Snapshot::Present { live, .. } | Snapshot::Absent { live } => live,
                    };
                    error!("[Rollback] 恢复 {:?} 失败: {}", live, e);
                    if first_err.is_none() {
                        first_err = Some(e.into());
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(restored),
        }
    }
}

// ============================================================================
// RestoreEngine
// ============================================================================

/// 取消待执行定时备份的回调
pub type CancelHook = Arc<dyn Fn() + Send + Sync>;

pub struct RestoreEngine {
    paths: LivePaths,
    work_dir: Option<PathBuf>,
    database_key: Option<String>,
    settings: Arc<dyn SettingsStore>,
    store: Arc<dyn RelationalStore>,
    notifier: Arc<Notifier>,
    limiter: OperationLimiter,
    cancel_pending: Option<CancelHook>,
}

impl RestoreEngine {
    pub fn new(
        config: &EngineConfig,
        settings: Arc<dyn SettingsStore>,
        store: Arc<dyn RelationalStore>,
        notifier: Arc<Notifier>,
        limiter: OperationLimiter,
    ) -> Self {
        Self {
            paths: config.live_paths(),
            work_dir: config.work_dir.clone(),
            database_key: config.database_key.clone(),
            settings,
            store,
            notifier,
            limiter,
            cancel_pending: None,
        }
    }

    pub fn with_cancel_hook(mut self, hook: CancelHook) -> Self {
        self.cancel_pending = Some(hook);
        self
    }

    /// 从同步目录恢复指定备份
    ///
    /// 不返回错误：失败会通过 `ImportOutcome` 与 `ImportError` 事件表达。
    /// 与备份互斥，若备份正在进行则等待其结束。
    pub async fn import_from_sync(self: &Arc<Self>, filename: &str, mode: ImportMode) -> ImportOutcome {
        if let Some(cancel) = &self.cancel_pending {
            cancel();
        }

        self.notifier.emit(SyncEvent::ImportStarted {
            filename: filename.to_string(),
            mode,
        });
        let session_id = uuid::Uuid::new_v4().to_string();
        info!(
            "[Restore] 开始恢复 {} (mode={}, session={})",
            filename,
            mode.as_str(),
            session_id
        );

        let result = match self.limiter.clone().acquire_owned().await {
            Ok(permit) => {
                let this = Arc::clone(self);
                let name = filename.to_string();
                let session = session_id.clone();
                match tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    this.run_restore(&session, &name, mode)
                })
                .await
                {
                    Ok(result) => result,
                    Err(join_err) => Err(SyncBackupError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("restore task failed: {}", join_err),
                    ))),
                }
            }
            Err(_) => Err(SyncBackupError::Busy),
        };

        match result {
            Ok(report) => {
                info!(
                    "[Restore] 恢复完成: {} (affected={}, merged={}, session={})",
                    filename, report.affected_count, report.merged_entries, session_id
                );
                self.notifier.emit(SyncEvent::ImportCompleted {
                    filename: filename.to_string(),
                    mode,
                    affected_count: report.affected_count,
                });
                ImportOutcome {
                    success: true,
                    message: format!(
                        "Restored {} ({} rows, {} config entries)",
                        filename, report.affected_count, report.merged_entries
                    ),
                    message_key: None,
                    affected_count: report.affected_count,
                    tables: report.tables,
                    merged_entries: report.merged_entries,
                }
            }
            Err(e) => {
                error!("[Restore] 恢复 {} 失败 (session={}): {}", filename, session_id, e);
                self.notifier.emit(SyncEvent::ImportError {
                    filename: filename.to_string(),
                    message_key: e.message_key().to_string(),
                    message: e.to_string(),
                });
                ImportOutcome::failed(&e)
            }
        }
    }

    fn session_dir(&self) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("chat-sync-restore-");
        let dir = match &self.work_dir {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    /// 同步执行恢复（调用方需已持有互斥许可）
    fn run_restore(&self, session_id: &str, filename: &str, mode: ImportMode) -> Result<RestoreReport> {
        let folder = self
            .settings
            .sync_folder_path()
            .ok_or(SyncBackupError::SyncFolderNotConfigured)?;
        let archive_path = resolve_backup_path(&folder, filename)?;

        // 会话目录随 TempDir 析构删除，覆盖所有退出路径
        let session = self.session_dir()?;
        let bytes = fs::read(&archive_path)?;
        let extracted = extract_archive(&bytes, &session.path().join("extract"))?;
        validate_extracted(&extracted)?;

        let live = LiveSyncSettings::capture(self.settings.as_ref());

        let mut guard = StoreGuard::enter(self.store.as_ref())?;
        let snapshots =
            SnapshotSet::capture(&self.paths.restorable_files(), &session.path().join("snapshots"))?;
        info!(
            "[Restore] 已为 {} 个在线文件建立快照 (session={})",
            snapshots.len(),
            session_id
        );

        let applied = self
            .apply(mode, &extracted, &live)
            .and_then(|report| guard.reopen().map(|_| report));

        match applied {
            Ok(report) => {
                self.notifier.refresh_sessions();
                if mode == ImportMode::Overwrite {
                    self.notifier.collapse_windows();
                }
                Ok(report)
            }
            Err(e) => {
                warn!("[Rollback] 恢复失败，开始回滚 (session={}): {}", session_id, e);
                if let Err(close_err) = guard.ensure_closed() {
                    error!("[Rollback] 回滚前关闭连接失败: {}", close_err);
                }
                match snapshots.restore_all() {
                    Ok(n) => info!("[Rollback] 已恢复 {} 个在线文件", n),
                    Err(restore_err) => error!("[Rollback] 快照恢复不完整: {}", restore_err),
                }
                if let Err(reopen_err) = guard.reopen() {
                    error!("[Rollback] 回滚后重新打开连接失败: {}", reopen_err);
                }
                self.notifier.refresh_sessions();
                Err(e)
            }
        }
    }

    fn apply(
        &self,
        mode: ImportMode,
        extracted: &ExtractedArchive,
        live: &LiveSyncSettings,
    ) -> Result<RestoreReport> {
        match mode {
            ImportMode::Overwrite => self.apply_overwrite(extracted, live),
            ImportMode::Increment => self.apply_increment(extracted),
        }
    }

    fn apply_overwrite(
        &self,
        extracted: &ExtractedArchive,
        live: &LiveSyncSettings,
    ) -> Result<RestoreReport> {
        let db_src = required_entry(extracted, entry_paths::DATABASE)?;
        let affected_count = {
            let conn = open_sqlite(db_src, self.database_key.as_deref())?;
            count_user_rows(&conn)?
        };

        resilient_copy_file(db_src, &self.paths.database)?;
        remove_sqlite_aux_files(&self.paths.database)?;
        info!("[Restore] 数据库已替换 ({} 行)", affected_count);

        let settings_src = required_entry(extracted, entry_paths::SETTINGS)?;
        apply_settings_file(settings_src, &self.paths.settings, live)?;
        let mut merged_entries = 1usize;

        for (entry, target) in [
            (entry_paths::CUSTOM_PROMPTS, &self.paths.custom_prompts),
            (entry_paths::SYSTEM_PROMPTS, &self.paths.system_prompts),
            (entry_paths::MCP_SETTINGS, &self.paths.mcp_settings),
        ] {
            if let Some(src) = extracted.path_of(entry) {
                resilient_copy_file(src, target)?;
                merged_entries += 1;
                debug!("[Restore] 已替换 {:?}", target);
            }
        }

        Ok(RestoreReport {
            affected_count,
            tables: BTreeMap::new(),
            merged_entries,
        })
    }

    fn apply_increment(&self, extracted: &ExtractedArchive) -> Result<RestoreReport> {
        let db_src = required_entry(extracted, entry_paths::DATABASE)?;
        let imported =
            import_database_file(db_src, &self.paths.database, self.database_key.as_deref())?;

        let mut merged_entries = 0usize;
        for (entry, target) in [
            (entry_paths::CUSTOM_PROMPTS, &self.paths.custom_prompts),
            (entry_paths::SYSTEM_PROMPTS, &self.paths.system_prompts),
        ] {
            if let Some(src) = extracted.path_of(entry) {
                merged_entries += merge_prompt_file(src, target)?;
            }
        }
        if let Some(src) = extracted.path_of(entry_paths::MCP_SETTINGS) {
            merged_entries += merge_registry_file(src, &self.paths.mcp_settings)?.total();
        }

        Ok(RestoreReport {
            affected_count: imported.total_inserted,
            tables: imported.tables,
            merged_entries,
        })
    }
}

fn required_entry<'a>(extracted: &'a ExtractedArchive, entry: &str) -> Result<&'a Path> {
    extracted
        .path_of(entry)
        .ok_or_else(|| SyncBackupError::MissingEntry(entry.to_string()))
}

/// 检查必需条目并校验清单；旧归档可能没有清单，此时只记录警告
fn validate_extracted(extracted: &ExtractedArchive) -> Result<()> {
    required_entry(extracted, entry_paths::DATABASE)?;
    required_entry(extracted, entry_paths::SETTINGS)?;

    match extracted.read(entry_paths::MANIFEST)? {
        Some(raw) => BackupManifest::from_bytes(&raw)?.verify(extracted),
        None => {
            warn!("[Restore] 归档中没有清单，跳过校验和检查");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::encode_archive;
    use crate::backup_common::new_operation_limiter;
    use crate::builder::testing::FixedSettings;
    use crate::events::testing::{RecordingSink, RecordingUi};
    use crate::store::SqliteStore;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingStore {
        open: AtomicBool,
        reopens: AtomicUsize,
        fail_reopen: AtomicBool,
    }

    impl RelationalStore for CountingStore {
        fn close(&self) -> Result<()> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn reopen(&self) -> Result<()> {
            self.reopens.fetch_add(1, Ordering::SeqCst);
            if self.fail_reopen.load(Ordering::SeqCst) {
                return Err(SyncBackupError::Store("reopen refused".to_string()));
            }
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_resolve_backup_path_rejects_bad_names() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("backup-1.zip"), b"x").unwrap();

        assert!(resolve_backup_path(dir.path(), "backup-1.zip").is_ok());
        for bad in [
            "../backup-1.zip",
            "sub/backup-1.zip",
            "backup-1.zip.tmp",
            "backup-.zip",
            "backup-abc.zip",
            "/tmp/backup-1.zip",
        ] {
            assert_matches!(
                resolve_backup_path(dir.path(), bad),
                Err(SyncBackupError::InvalidFilename(_)),
                "{} 应被拒绝",
                bad
            );
        }
        assert_matches!(
            resolve_backup_path(dir.path(), "backup-2.zip"),
            Err(SyncBackupError::Io(_))
        );
    }

    #[test]
    fn test_import_mode_parse() {
        assert_eq!("Overwrite".parse::<ImportMode>().unwrap(), ImportMode::Overwrite);
        assert_eq!(" increment ".parse::<ImportMode>().unwrap(), ImportMode::Increment);
        assert!("merge".parse::<ImportMode>().is_err());
        assert_eq!(serde_json::to_value(ImportMode::Increment).unwrap(), "increment");
    }

    #[test]
    fn test_store_guard_reopens_on_drop() {
        let store = CountingStore::default();
        {
            let _guard = StoreGuard::enter(&store).unwrap();
            assert!(!store.is_open());
        }
        assert!(store.is_open(), "守卫析构后连接应重新打开");
        assert_eq!(store.reopens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_store_guard_does_not_reopen_twice() {
        let store = CountingStore::default();
        {
            let mut guard = StoreGuard::enter(&store).unwrap();
            guard.reopen().unwrap();
        }
        assert_eq!(store.reopens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_store_guard_retries_after_failed_reopen() {
        let store = CountingStore::default();
        store.fail_reopen.store(true, Ordering::SeqCst);
        {
            let mut guard = StoreGuard::enter(&store).unwrap();
            assert!(guard.reopen().is_err());
            store.fail_reopen.store(false, Ordering::SeqCst);
        }
        assert!(store.is_open());
        assert_eq!(store.reopens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_snapshot_restore_handles_present_and_absent() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("present.json");
        let absent = dir.path().join("absent.json");
        fs::write(&present, b"before").unwrap();

        let snapshots = SnapshotSet::capture(
            &[present.clone(), absent.clone()],
            &dir.path().join("snap"),
        )
        .unwrap();
        assert_eq!(snapshots.len(), 2);

        fs::write(&present, b"after").unwrap();
        fs::write(&absent, b"created").unwrap();

        assert_eq!(snapshots.restore_all().unwrap(), 2);
        assert_eq!(fs::read(&present).unwrap(), b"before");
        assert!(!absent.exists(), "快照时不存在的文件应被删除");
    }

    struct Fixture {
        _dir: TempDir,
        sync_dir: PathBuf,
        paths: LivePaths,
        engine: Arc<RestoreEngine>,
        store: Arc<SqliteStore>,
        ui: Arc<RecordingUi>,
        sink: Arc<RecordingSink>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let app_dir = dir.path().join("app");
        let sync_dir = dir.path().join("sync");
        fs::create_dir_all(&app_dir).unwrap();
        fs::create_dir_all(&sync_dir).unwrap();

        let mut config = EngineConfig::with_app_data_dir(&app_dir);
        config.work_dir = Some(dir.path().join("work"));
        let paths = config.live_paths();
        let store = Arc::new(SqliteStore::open(&paths.database, None).unwrap());
        store
            .with_connection(|c| {
                c.execute_batch(
                    "CREATE TABLE conversations (id TEXT PRIMARY KEY, title TEXT);
                     INSERT INTO conversations VALUES ('local', 'mine');",
                )
            })
            .unwrap();
        fs::write(&paths.settings, br#"{"theme":"light"}"#).unwrap();

        let sink = Arc::new(RecordingSink::default());
        let ui = Arc::new(RecordingUi::default());
        let notifier = Arc::new(Notifier::new(sink.clone(), ui.clone()));
        let engine = RestoreEngine::new(
            &config,
            Arc::new(FixedSettings::enabled(&sync_dir)),
            store.clone(),
            notifier,
            new_operation_limiter(),
        );

        Fixture {
            _dir: dir,
            sync_dir,
            paths,
            engine: Arc::new(engine),
            store,
            ui,
            sink,
        }
    }

    fn backup_db_bytes(dir: &Path, rows: &[(&str, &str)]) -> Vec<u8> {
        let path = dir.join("source.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE conversations (id TEXT PRIMARY KEY, title TEXT);")
            .unwrap();
        for (id, title) in rows {
            conn.execute("INSERT INTO conversations VALUES (?1, ?2)", [id, title])
                .unwrap();
        }
        drop(conn);
        fs::read(&path).unwrap()
    }

    fn write_backup(sync_dir: &Path, name: &str, entries: Vec<(&str, Vec<u8>)>) {
        let entries: Vec<(String, Vec<u8>)> = entries
            .into_iter()
            .map(|(p, d)| (p.to_string(), d))
            .collect();
        fs::write(sync_dir.join(name), encode_archive(&entries).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_missing_settings_entry_leaves_live_state_untouched() {
        let fx = fixture();
        let scratch = TempDir::new().unwrap();
        write_backup(
            &fx.sync_dir,
            "backup-10.zip",
            vec![(entry_paths::DATABASE, backup_db_bytes(scratch.path(), &[("a", "b")]))],
        );
        let before = fs::read(&fx.paths.settings).unwrap();

        let outcome = fx
            .engine
            .import_from_sync("backup-10.zip", ImportMode::Overwrite)
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.message_key.as_deref(), Some("sync.error.incompleteArchive"));
        assert_eq!(fs::read(&fx.paths.settings).unwrap(), before);
        assert!(fx.store.is_open());
        assert_eq!(fx.ui.refresh_count(), 0, "未触及在线数据时不应刷新界面");
    }

    #[tokio::test]
    async fn test_overwrite_replaces_database_and_collapses_windows() {
        let fx = fixture();
        let scratch = TempDir::new().unwrap();
        write_backup(
            &fx.sync_dir,
            "backup-20.zip",
            vec![
                (
                    entry_paths::DATABASE,
                    backup_db_bytes(scratch.path(), &[("r1", "one"), ("r2", "two")]),
                ),
                (entry_paths::SETTINGS, br#"{"theme":"dark"}"#.to_vec()),
                (entry_paths::CUSTOM_PROMPTS, br#"{"prompts":[{"id":"p"}]}"#.to_vec()),
            ],
        );

        let outcome = fx
            .engine
            .import_from_sync("backup-20.zip", ImportMode::Overwrite)
            .await;
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.affected_count, 2);
        assert_eq!(outcome.merged_entries, 2);

        let ids: Vec<String> = fx
            .store
            .with_connection(|c| {
                let mut stmt = c.prepare("SELECT id FROM conversations ORDER BY id")?;
                let rows = stmt.query_map([], |r| r.get(0))?;
                rows.collect()
            })
            .unwrap();
        assert_eq!(ids, vec!["r1".to_string(), "r2".to_string()]);
        assert!(fx.paths.custom_prompts.exists());
        assert_eq!(fx.ui.refresh_count(), 1);
        assert_eq!(fx.ui.collapse_count(), 1);

        let events = fx.sink.snapshot();
        assert_matches!(events.first(), Some(SyncEvent::ImportStarted { .. }));
        assert_matches!(
            events.last(),
            Some(SyncEvent::ImportCompleted { affected_count: 2, .. })
        );
    }

    #[tokio::test]
    async fn test_increment_keeps_local_rows_and_skips_collapse() {
        let fx = fixture();
        let scratch = TempDir::new().unwrap();
        write_backup(
            &fx.sync_dir,
            "backup-30.zip",
            vec![
                (
                    entry_paths::DATABASE,
                    backup_db_bytes(scratch.path(), &[("local", "theirs"), ("remote", "new")]),
                ),
                (entry_paths::SETTINGS, br#"{}"#.to_vec()),
            ],
        );

        let outcome = fx
            .engine
            .import_from_sync("backup-30.zip", ImportMode::Increment)
            .await;
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.affected_count, 1);
        assert_eq!(outcome.tables.get("conversations"), Some(&1));

        let title: String = fx
            .store
            .with_connection(|c| {
                c.query_row("SELECT title FROM conversations WHERE id = 'local'", [], |r| {
                    r.get(0)
                })
            })
            .unwrap();
        assert_eq!(title, "mine", "已存在的行不应被覆盖");
        assert_eq!(fx.ui.collapse_count(), 0);
        assert_eq!(fx.ui.refresh_count(), 1);
    }
}
