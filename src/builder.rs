//! 备份归档构建
//!
//! 把在线数据库主文件与各 JSON 配置文件打包为 `backup-<unix毫秒>.zip`，放在同步目录下。
//!
//! ## 流程
//! 1. `Preparing`：确保同步目录存在，检查数据库与设置文件存在，执行 WAL checkpoint
//! 2. `Collecting`：读取数据库与全部存在的配置文件
//! 3. 生成清单，作为最后一个条目
//! 4. `Compressing`：编码并写入 `<name>.zip.tmp`
//! 5. `Finalizing`：rename 到最终文件名（原子替换）
//! 6. 记录上次同步时间，按保留数量清理旧备份
//!
//! 第 5 步之前任何失败都会删除临时文件并进入 `Error`，随后回到 `Idle`。
//! 因此最终文件名要么不存在，要么指向一个完整的归档。

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use tracing::{debug, error, info, warn};

use crate::archive::{encode_archive, entry_paths};
use crate::backup_common::{log_and_skip_entry_err, resilient_remove_file, OperationLimiter};
use crate::config::{EngineConfig, LivePaths};
use crate::error::{Result, SyncBackupError};
use crate::events::{Notifier, SyncEvent};
use crate::manifest::BackupManifest;
use crate::status::{BackupStatus, StatusTracker};
use crate::store::{RelationalStore, SettingsStore};

static BACKUP_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^backup-(\d+)\.zip$").unwrap());

pub fn backup_file_name(created_at: i64) -> String {
    format!("backup-{}.zip", created_at)
}

pub fn is_backup_file_name(name: &str) -> bool {
    BACKUP_NAME_RE.is_match(name)
}

/// 从文件名中解析时间戳；不匹配或溢出时返回 `None`
pub fn parse_backup_timestamp(name: &str) -> Option<i64> {
    BACKUP_NAME_RE
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok())
}

/// 备份文件信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub filename: String,
    /// 创建时间（Unix 毫秒）
    pub created_at: i64,
    pub size: u64,
}

/// 对外暴露的状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatusSnapshot {
    pub status: BackupStatus,
    pub is_backing_up: bool,
    pub last_error: Option<String>,
    pub last_sync_time: Option<i64>,
}

/// 列出同步目录中的备份，按内嵌时间戳倒序（解析失败时用修改时间）
pub fn list_backups(folder: &Path) -> Result<Vec<BackupInfo>> {
    if !folder.is_dir() {
        return Ok(Vec::new());
    }

    let mut backups = Vec::new();
    for entry in fs::read_dir(folder)?.filter_map(log_and_skip_entry_err) {
        let filename = entry.file_name().to_string_lossy().into_owned();
        if !is_backup_file_name(&filename) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            Ok(_) => continue,
            Err(e) => {
                warn!("[Backup] 读取备份元数据失败 {}: {}", filename, e);
                continue;
            }
        };

        let created_at = parse_backup_timestamp(&filename).unwrap_or_else(|| {
            metadata
                .modified()
                .ok()
                .map(|t| chrono::DateTime::<Utc>::from(t).timestamp_millis())
                .unwrap_or(0)
        });

        backups.push(BackupInfo {
            filename,
            created_at,
            size: metadata.len(),
        });
    }

    backups.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.filename.cmp(&a.filename))
    });
    Ok(backups)
}

/// 只保留最新的 `keep` 个备份，返回删除数量
pub fn cleanup_old_backups(folder: &Path, keep: usize) -> Result<usize> {
    let mut removed = 0;
    for stale in list_backups(folder)?.iter().skip(keep) {
        let path = folder.join(&stale.filename);
        info!("[Backup] 删除旧备份: {}", path.display());
        match resilient_remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("[Backup] 删除旧备份失败 {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

/// 时间来源（Unix 毫秒）
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(|| Utc::now().timestamp_millis())
}

/// 临时归档文件守卫：未提交时 Drop 删除文件
struct TempArchive {
    path: PathBuf,
    committed: bool,
}

impl TempArchive {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(&mut self, final_path: &Path) -> std::io::Result<()> {
        fs::rename(&self.path, final_path)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for TempArchive {
    fn drop(&mut self) {
        if !self.committed && self.path.exists() {
            if let Err(e) = fs::remove_file(&self.path) {
                error!("[Backup] 删除临时归档失败 {:?}: {}", self.path, e);
            } else {
                debug!("[Backup] 已删除临时归档 {:?}", self.path);
            }
        }
    }
}

/// `is_backing_up` 标志守卫，只用于状态上报；互斥由 `OperationLimiter` 保证
struct RunningFlag<'a>(&'a AtomicBool);

impl<'a> RunningFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct BackupBuilder {
    paths: LivePaths,
    settings: Arc<dyn SettingsStore>,
    store: Arc<dyn RelationalStore>,
    notifier: Arc<Notifier>,
    status: StatusTracker,
    limiter: OperationLimiter,
    running: AtomicBool,
    max_backups: Option<usize>,
    clock: Clock,
}

impl BackupBuilder {
    pub fn new(
        config: &EngineConfig,
        settings: Arc<dyn SettingsStore>,
        store: Arc<dyn RelationalStore>,
        notifier: Arc<Notifier>,
        limiter: OperationLimiter,
    ) -> Self {
        Self {
            paths: config.live_paths(),
            settings,
            store,
            status: StatusTracker::new(notifier.clone()),
            notifier,
            limiter,
            running: AtomicBool::new(false),
            max_backups: config.max_backups,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_backing_up(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> BackupStatusSnapshot {
        BackupStatusSnapshot {
            status: self.status.current(),
            is_backing_up: self.is_backing_up(),
            last_error: self.status.last_error(),
            last_sync_time: self.settings.last_sync_time(),
        }
    }

    fn sync_folder(&self) -> Result<PathBuf> {
        if !self.settings.is_sync_enabled() {
            return Err(SyncBackupError::SyncDisabled);
        }
        self.settings
            .sync_folder_path()
            .ok_or(SyncBackupError::SyncFolderNotConfigured)
    }

    /// 开始一次备份
    ///
    /// 已有备份或恢复在进行时直接返回 `Ok(None)`，不排队。
    pub async fn start_backup(self: &Arc<Self>) -> Result<Option<BackupInfo>> {
        let job_id = uuid::Uuid::new_v4().to_string();

        let folder = match self.sync_folder() {
            Ok(folder) => folder,
            Err(e) => {
                warn!("[Backup] 前置条件不满足: {}", e);
                self.emit_error(&job_id, &e);
                return Err(e);
            }
        };

        let permit = match self.limiter.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                info!("[Backup] 已有备份或恢复在进行，忽略本次请求");
                return Ok(None);
            }
        };

        self.notifier.emit(SyncEvent::BackupStarted {
            job_id: job_id.clone(),
        });

        let this = Arc::clone(self);
        let job = job_id.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            this.run_backup(&folder, &job)
        })
        .await;

        let result = match joined {
            Ok(result) => result,
            Err(join_err) => {
                self.status.fail(join_err.to_string());
                Err(SyncBackupError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("backup task failed: {}", join_err),
                )))
            }
        };

        match result {
            Ok(info) => {
                self.notifier.emit(SyncEvent::BackupCompleted {
                    job_id,
                    info: info.clone(),
                });
                Ok(Some(info))
            }
            Err(e) => {
                self.emit_error(&job_id, &e);
                Err(e)
            }
        }
    }

    fn emit_error(&self, job_id: &str, err: &SyncBackupError) {
        self.notifier.emit(SyncEvent::BackupError {
            job_id: job_id.to_string(),
            message_key: err.message_key().to_string(),
            message: err.to_string(),
        });
    }

    /// 同步执行备份（调用方需已持有互斥许可）
    fn run_backup(&self, folder: &Path, job_id: &str) -> Result<BackupInfo> {
        let _flag = RunningFlag::raise(&self.running);

        self.status.transition(BackupStatus::Preparing);
        match self.build_archive(folder, job_id) {
            Ok(info) => {
                self.status.transition(BackupStatus::Idle);
                Ok(info)
            }
            Err(e) => {
                error!("[Backup] 备份失败 (job={}): {}", job_id, e);
                self.status.fail(e.to_string());
                Err(e)
            }
        }
    }

    fn build_archive(&self, folder: &Path, job_id: &str) -> Result<BackupInfo> {
        // Preparing
        fs::create_dir_all(folder)?;
        if !self.paths.database.is_file() {
            return Err(SyncBackupError::MissingSource(
                self.paths.database.display().to_string(),
            ));
        }
        if !self.paths.settings.is_file() {
            return Err(SyncBackupError::MissingSource(
                self.paths.settings.display().to_string(),
            ));
        }
        if let Err(e) = self.store.checkpoint() {
            warn!("[Backup] WAL checkpoint 失败，继续备份主库文件: {}", e);
        }

        // Collecting
        self.status.transition(BackupStatus::Collecting);
        let created_at = (self.clock)();
        let mut manifest = BackupManifest::new(created_at);
        let mut entries: Vec<(String, Vec<u8>)> = Vec::with_capacity(6);

        let required = [
            (entry_paths::DATABASE, &self.paths.database),
            (entry_paths::SETTINGS, &self.paths.settings),
        ];
        for (entry, path) in required {
            let data = fs::read(path)?;
            manifest.record(entry, &data);
            entries.push((entry.to_string(), data));
        }

        let optional = [
            (entry_paths::CUSTOM_PROMPTS, &self.paths.custom_prompts),
            (entry_paths::SYSTEM_PROMPTS, &self.paths.system_prompts),
            (entry_paths::MCP_SETTINGS, &self.paths.mcp_settings),
        ];
        for (entry, path) in optional {
            if !path.exists() {
                debug!("[Backup] 配置文件不存在，跳过: {:?}", path);
                continue;
            }
            let data = fs::read(path)?;
            manifest.record(entry, &data);
            entries.push((entry.to_string(), data));
        }
        entries.push((entry_paths::MANIFEST.to_string(), manifest.to_bytes()?));

        // Compressing
        self.status.transition(BackupStatus::Compressing);
        let filename = backup_file_name(created_at);
        let final_path = folder.join(&filename);
        let mut temp = TempArchive::new(folder.join(format!("{}.tmp", filename)));

        let bytes = encode_archive(&entries)?;
        {
            let mut file = File::create(&temp.path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }

        // Finalizing
        self.status.transition(BackupStatus::Finalizing);
        temp.commit(&final_path)?;
        let size = fs::metadata(&final_path)?.len();
        info!(
            "[Backup] 备份完成 (job={}): {} ({} 字节，{} 个条目)",
            job_id,
            filename,
            size,
            entries.len()
        );

        if let Err(e) = self.settings.set_last_sync_time(created_at) {
            warn!("[Backup] 记录上次同步时间失败: {}", e);
        }
        if let Some(keep) = self.max_backups {
            match cleanup_old_backups(folder, keep) {
                Ok(0) => {}
                Ok(n) => info!("[Backup] 已清理 {} 个旧备份", n),
                Err(e) => warn!("[Backup] 清理旧备份失败: {}", e),
            }
        }

        Ok(BackupInfo {
            filename,
            created_at,
            size,
        })
    }
}
