//! 同步备份服务
//!
//! 把构建器、恢复引擎与调度器组装在一起，对外暴露七个操作：
//! `check_sync_folder` / `open_sync_folder` / `get_backup_status` / `list_backups` /
//! `start_backup` / `cancel_backup` / `import_from_sync`。
//! 三个组件共享同一个互斥许可，备份与恢复不会同时进行。

use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::backup_common::new_operation_limiter;
use crate::builder::{list_backups, BackupBuilder, BackupInfo, BackupStatusSnapshot, Clock};
use crate::config::EngineConfig;
use crate::error::{Result, SyncBackupError};
use crate::events::{EventSink, Notifier, UiHost};
use crate::restore::{ImportMode, ImportOutcome, RestoreEngine};
use crate::scheduler::BackupScheduler;
use crate::store::{JsonSettingsStore, RelationalStore, SettingsStore, SqliteStore};

/// 同步目录检查结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFolderStatus {
    pub enabled: bool,
    pub path: Option<PathBuf>,
    pub exists: bool,
    pub writable: bool,
    pub backup_count: usize,
}

pub struct SyncService {
    settings: Arc<dyn SettingsStore>,
    notifier: Arc<Notifier>,
    builder: Arc<BackupBuilder>,
    restore: Arc<RestoreEngine>,
    scheduler: Arc<BackupScheduler>,
}

impl SyncService {
    pub fn new(
        config: &EngineConfig,
        settings: Arc<dyn SettingsStore>,
        store: Arc<dyn RelationalStore>,
    ) -> Self {
        Self::build(config, settings, store, None)
    }

    /// 使用自定义时钟（备份文件名中的时间戳来自它）
    pub fn with_clock(
        config: &EngineConfig,
        settings: Arc<dyn SettingsStore>,
        store: Arc<dyn RelationalStore>,
        clock: Clock,
    ) -> Self {
        Self::build(config, settings, store, Some(clock))
    }

    /// 以文件设置存储与 SQLite 句柄打开默认服务
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let paths = config.live_paths();
        let settings = Arc::new(JsonSettingsStore::new(&paths.settings));
        let store = Arc::new(SqliteStore::open(&paths.database, config.database_key.clone())?);
        Ok(Self::new(config, settings, store))
    }

    fn build(
        config: &EngineConfig,
        settings: Arc<dyn SettingsStore>,
        store: Arc<dyn RelationalStore>,
        clock: Option<Clock>,
    ) -> Self {
        let limiter = new_operation_limiter();
        let notifier = Arc::new(Notifier::default());

        let mut builder = BackupBuilder::new(
            config,
            settings.clone(),
            store.clone(),
            notifier.clone(),
            limiter.clone(),
        );
        if let Some(clock) = clock {
            builder = builder.with_clock(clock);
        }
        let builder = Arc::new(builder);

        let scheduler = Arc::new(BackupScheduler::new(
            config.debounce_window(),
            settings.clone(),
            builder.clone(),
        ));

        let pending = scheduler.clone();
        let restore = Arc::new(
            RestoreEngine::new(config, settings.clone(), store, notifier.clone(), limiter)
                .with_cancel_hook(Arc::new(move || {
                    pending.cancel();
                })),
        );

        Self {
            settings,
            notifier,
            builder,
            restore,
            scheduler,
        }
    }

    pub fn register_sink(&self, sink: Arc<dyn EventSink>) {
        self.notifier.register_sink(sink);
    }

    pub fn register_ui(&self, ui: Arc<dyn UiHost>) {
        self.notifier.register_ui(ui);
    }

    fn sync_folder(&self) -> Result<PathBuf> {
        self.settings
            .sync_folder_path()
            .ok_or(SyncBackupError::SyncFolderNotConfigured)
    }

    /// 检查同步目录是否已配置、存在且可写
    pub fn check_sync_folder(&self) -> SyncFolderStatus {
        let enabled = self.settings.is_sync_enabled();
        let Some(path) = self.settings.sync_folder_path() else {
            return SyncFolderStatus {
                enabled,
                path: None,
                exists: false,
                writable: false,
                backup_count: 0,
            };
        };

        let exists = path.is_dir();
        let writable = exists && tempfile::NamedTempFile::new_in(&path).is_ok();
        let backup_count = if exists {
            list_backups(&path).map(|list| list.len()).unwrap_or(0)
        } else {
            0
        };
        debug!(
            "[Sync] 同步目录检查: {:?} exists={} writable={} backups={}",
            path, exists, writable, backup_count
        );

        SyncFolderStatus {
            enabled,
            path: Some(path),
            exists,
            writable,
            backup_count,
        }
    }

    /// 确保同步目录存在，并请求界面在文件管理器中打开它
    pub fn open_sync_folder(&self) -> Result<PathBuf> {
        let folder = self.sync_folder()?;
        fs::create_dir_all(&folder)?;
        self.notifier.reveal_folder(&folder)?;
        Ok(folder)
    }

    pub fn get_backup_status(&self) -> BackupStatusSnapshot {
        self.builder.status()
    }

    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        list_backups(&self.sync_folder()?)
    }

    /// 手动开始备份，同时清除待执行的定时备份
    pub async fn start_backup(&self) -> Result<Option<BackupInfo>> {
        self.scheduler.cancel();
        self.builder.start_backup().await
    }

    /// 只取消尚未开始的定时备份
    pub fn cancel_backup(&self) -> bool {
        let cancelled = self.scheduler.cancel();
        if !cancelled {
            debug!("[Sync] 没有待执行的定时备份");
        }
        cancelled
    }

    pub async fn import_from_sync(&self, filename: &str, mode: ImportMode) -> ImportOutcome {
        self.restore.import_from_sync(filename, mode).await
    }

    /// 外部“数据已变更”通知
    pub fn notify_data_changed(&self) -> bool {
        self.scheduler.notify_data_changed()
    }

    pub fn has_pending_backup(&self) -> bool {
        self.scheduler.has_pending()
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        if self.scheduler.cancel() {
            info!("[Sync] 服务关闭，已取消待执行的定时备份");
        }
    }
}
