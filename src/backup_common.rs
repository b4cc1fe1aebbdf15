//! 备份系统共享组件
//!
//! 提供备份与恢复共用的工具
//! - 操作互斥：备份与恢复共享同一个单许可信号量，保证二者串行
//! - SHA256计算：清单中的条目校验和
//! - 安全防护：ZIP炸弹检测
//! - 带重试的文件复制/删除、SQLite 辅助文件处理、原子写入

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::{Result, SyncBackupError};

/// 记录并跳过迭代中的错误，避免 `.flatten()` 静默丢弃
pub fn log_and_skip_entry_err<T, E: std::fmt::Display>(
    result: std::result::Result<T, E>,
) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("[BackupCommon] Directory entry read error (skipped): {}", e);
            None
        }
    }
}

/// 获取 Mutex 锁，中毒时恢复内部值而非 panic
pub fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                "[BackupCommon] Mutex poisoned! Attempting recovery for type: {:?}",
                std::any::type_name::<T>()
            );
            poisoned.into_inner()
        }
    }
}

// ============================================================================
// 安全常量 - 防止 ZIP 炸弹和资源耗尽攻击
// ============================================================================

/// 最大允许解压总大小: 10GB
pub const MAX_UNCOMPRESSED_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// 最大允许单文件大小: 4GB
pub const MAX_SINGLE_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// 压缩比告警阈值
pub const MAX_COMPRESSION_RATIO: u64 = 100;

/// 极端压缩比阈值，超过即视为 ZIP 炸弹
pub const EXTREME_COMPRESSION_RATIO: u64 = 1000;

/// 最大允许条目数量（正常备份只有 6 个条目）
pub const MAX_FILE_COUNT: usize = 1_000;

/// 重试次数常量
pub const RESILIENT_RETRY_COUNT: u32 = 5;

/// 重试延迟(毫秒)
pub const RESILIENT_RETRY_DELAY_MS: u64 = 150;

// ============================================================================
// 操作互斥
// ============================================================================

/// 备份/恢复互斥锁
///
/// 由 [`crate::service::SyncService`] 创建一次，同时交给备份构建器与恢复引擎。
/// 使用 `OwnedSemaphorePermit` 可跨 `.await` 与 `spawn_blocking` 持有。
pub type OperationLimiter = Arc<Semaphore>;

pub fn new_operation_limiter() -> OperationLimiter {
    Arc::new(Semaphore::new(1))
}

// ============================================================================
// 哈希
// ============================================================================

/// 计算字节数组的SHA256哈希值（十六进制）
pub fn calculate_bytes_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ============================================================================
// ZIP 炸弹检测
// ============================================================================

/// ZIP 安全验证结果
#[derive(Debug)]
pub struct ZipSecurityCheck {
    pub total_uncompressed_size: u64,
    pub total_compressed_size: u64,
    pub file_count: usize,
    pub compression_ratio: f64,
    pub largest_file_size: u64,
    pub largest_file_name: String,
}

impl ZipSecurityCheck {
    pub fn validate(&self) -> Result<()> {
        if self.file_count > MAX_FILE_COUNT {
            return Err(SyncBackupError::ArchiveLimit(format!(
                "{} entries (limit {})",
                self.file_count, MAX_FILE_COUNT
            )));
        }

        if self.total_uncompressed_size > MAX_UNCOMPRESSED_SIZE {
            return Err(SyncBackupError::ArchiveLimit(format!(
                "uncompressed size {} bytes (limit {})",
                self.total_uncompressed_size, MAX_UNCOMPRESSED_SIZE
            )));
        }

        if self.largest_file_size > MAX_SINGLE_FILE_SIZE {
            return Err(SyncBackupError::ArchiveLimit(format!(
                "entry '{}' is {} bytes (limit {})",
                self.largest_file_name, self.largest_file_size, MAX_SINGLE_FILE_SIZE
            )));
        }

        if self.compression_ratio > EXTREME_COMPRESSION_RATIO as f64 {
            return Err(SyncBackupError::ArchiveLimit(format!(
                "compression ratio {:.1} exceeds {}",
                self.compression_ratio, EXTREME_COMPRESSION_RATIO
            )));
        } else if self.compression_ratio > MAX_COMPRESSION_RATIO as f64 {
            tracing::warn!(
                "[BackupCommon] ZIP 压缩比较高 ({:.1} > {})",
                self.compression_ratio,
                MAX_COMPRESSION_RATIO
            );
        }

        Ok(())
    }
}

/// 在解压前统计归档的条目数量与解压后大小
pub fn check_zip_security(archive_bytes: &[u8]) -> Result<ZipSecurityCheck> {
    let mut archive = zip::ZipArchive::new(Cursor::new(archive_bytes))?;

    let file_count = archive.len();
    let mut total_uncompressed = 0u64;
    let mut largest_size = 0u64;
    let mut largest_name = String::new();

    for i in 0..file_count {
        let file = archive.by_index_raw(i)?;
        let size = file.size();
        total_uncompressed = total_uncompressed.saturating_add(size);
        if size > largest_size {
            largest_size = size;
            largest_name = file.name().to_string();
        }
    }

    let compressed_size = archive_bytes.len() as u64;
    let compression_ratio = if compressed_size > 0 {
        total_uncompressed as f64 / compressed_size as f64
    } else {
        0.0
    };

    Ok(ZipSecurityCheck {
        total_uncompressed_size: total_uncompressed,
        total_compressed_size: compressed_size,
        file_count,
        compression_ratio,
        largest_file_size: largest_size,
        largest_file_name: largest_name,
    })
}

// ============================================================================
// 文件操作
// ============================================================================

/// SQLite 主库对应的 WAL/SHM 辅助文件路径
pub fn sqlite_aux_paths(db_path: &Path) -> [PathBuf; 2] {
    let base = db_path.as_os_str().to_owned();
    let mut wal = base.clone();
    wal.push("-wal");
    let mut shm = base;
    shm.push("-shm");
    [PathBuf::from(wal), PathBuf::from(shm)]
}

/// 删除主库的 WAL/SHM 辅助文件，不存在时忽略
pub fn remove_sqlite_aux_files(db_path: &Path) -> std::io::Result<()> {
    for aux in sqlite_aux_paths(db_path) {
        if aux.exists() {
            resilient_remove_file(&aux)?;
        }
    }
    Ok(())
}

/// 带重试的删除，缓解 Windows 上短暂占用导致的瞬时失败
pub fn resilient_remove_file(path: &Path) -> std::io::Result<()> {
    let mut last_err: Option<std::io::Error> = None;
    for _ in 0..RESILIENT_RETRY_COUNT {
        if let Ok(md) = fs::metadata(path) {
            let mut perms = md.permissions();
            if perms.readonly() {
                perms.set_readonly(false);
                let _ = fs::set_permissions(path, perms);
            }
        }
        match fs::remove_file(path) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                std::thread::sleep(Duration::from_millis(RESILIENT_RETRY_DELAY_MS));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "unknown error")))
}

/// 带重试的复制，目标父目录不存在时自动创建
pub fn resilient_copy_file(src: &Path, dst: &Path) -> std::io::Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut last_err: Option<std::io::Error> = None;
    for _ in 0..RESILIENT_RETRY_COUNT {
        match fs::copy(src, dst) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !src.exists() => {
                return Err(e);
            }
            Err(e) => {
                last_err = Some(e);
                std::thread::sleep(Duration::from_millis(RESILIENT_RETRY_DELAY_MS));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "unknown error")))
}

/// 原子写入：先写同目录下的 `.tmp` 文件并 fsync，再 rename 覆盖目标
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let result = (|| {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}
