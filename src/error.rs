//! 备份/恢复引擎的统一错误类型
//!
//! 错误分为四类（见 [`ErrorKind`]）：
//! - 前置条件错误：同步未开启、同步目录缺失、待备份文件不存在
//! - 归档校验错误：文件名非法、路径穿越、必需条目缺失、校验和不符
//! - IO 错误：复制/写入失败
//! - 合并错误：备份中的 JSON 文档无法解析等（恢复时视为致命）

use serde::Serialize;

pub type Result<T> = std::result::Result<T, SyncBackupError>;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Precondition,
    ArchiveValidation,
    Io,
    Merge,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncBackupError {
    #[error("Sync is disabled")]
    SyncDisabled,

    #[error("Sync folder is not configured")]
    SyncFolderNotConfigured,

    #[error("Required source file missing: {0}")]
    MissingSource(String),

    #[error("Invalid backup filename: {0}")]
    InvalidFilename(String),

    #[error("Unsafe archive entry: {0}")]
    UnsafeEntry(String),

    #[error("Archive entry missing: {0}")]
    MissingEntry(String),

    #[error("Archive limit exceeded: {0}")]
    ArchiveLimit(String),

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Unsupported archive format version: {0}")]
    UnsupportedVersion(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Import of table '{table}' failed: {message}")]
    TableImport { table: String, message: String },

    #[error("Merge of {file} failed: {message}")]
    Merge { file: String, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Another backup or restore is in progress")]
    Busy,
}

impl From<rusqlite::Error> for SyncBackupError {
    fn from(err: rusqlite::Error) -> Self {
        SyncBackupError::Database(err.to_string())
    }
}

impl SyncBackupError {
    pub fn merge(file: impl Into<String>, message: impl Into<String>) -> Self {
        SyncBackupError::Merge {
            file: file.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncBackupError::SyncDisabled
            | SyncBackupError::SyncFolderNotConfigured
            | SyncBackupError::MissingSource(_)
            | SyncBackupError::Busy => ErrorKind::Precondition,
            SyncBackupError::InvalidFilename(_)
            | SyncBackupError::UnsafeEntry(_)
            | SyncBackupError::MissingEntry(_)
            | SyncBackupError::ArchiveLimit(_)
            | SyncBackupError::ChecksumMismatch { .. }
            | SyncBackupError::UnsupportedVersion(_)
            | SyncBackupError::Zip(_) => ErrorKind::ArchiveValidation,
            SyncBackupError::Io(_)
            | SyncBackupError::Database(_)
            | SyncBackupError::TableImport { .. }
            | SyncBackupError::Store(_) => ErrorKind::Io,
            SyncBackupError::Merge { .. } | SyncBackupError::Json(_) => ErrorKind::Merge,
        }
    }

    /// 面向界面的消息键，调用方无需关心内部错误类型
    pub fn message_key(&self) -> &'static str {
        match self {
            SyncBackupError::SyncDisabled => "sync.error.syncDisabled",
            SyncBackupError::SyncFolderNotConfigured => "sync.error.folderNotConfigured",
            SyncBackupError::MissingSource(_) => "sync.error.nothingToBackup",
            SyncBackupError::InvalidFilename(_) => "sync.error.invalidFilename",
            SyncBackupError::UnsafeEntry(_) => "sync.error.unsafeArchive",
            SyncBackupError::MissingEntry(_) => "sync.error.incompleteArchive",
            SyncBackupError::ArchiveLimit(_) => "sync.error.archiveTooLarge",
            SyncBackupError::ChecksumMismatch { .. } => "sync.error.corruptArchive",
            SyncBackupError::UnsupportedVersion(_) => "sync.error.unsupportedVersion",
            SyncBackupError::Zip(_) => "sync.error.corruptArchive",
            SyncBackupError::Io(_) => "sync.error.io",
            SyncBackupError::Database(_) | SyncBackupError::Store(_) => "sync.error.database",
            SyncBackupError::TableImport { .. } => "sync.error.importFailed",
            SyncBackupError::Merge { .. } | SyncBackupError::Json(_) => "sync.error.mergeFailed",
            SyncBackupError::Busy => "sync.error.busy",
        }
    }
}
