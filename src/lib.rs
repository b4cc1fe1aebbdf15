// Chat Sync library entry
// 会话数据库与 JSON 配置文件的备份、恢复与防抖调度。

pub mod archive;
pub mod backup_common;
pub mod builder;
pub mod config;
pub mod error;
pub mod events;
pub mod manifest;
pub mod merge;
pub mod restore;
pub mod scheduler;
pub mod service;
pub mod status;
pub mod store;
pub mod table_import;

pub use builder::{BackupInfo, BackupStatusSnapshot};
pub use config::{EngineConfig, LivePaths};
pub use error::{ErrorKind, Result, SyncBackupError};
pub use events::{EventSink, NoopUiHost, Notifier, SyncEvent, TracingEventSink, UiHost};
pub use restore::{ImportMode, ImportOutcome};
pub use service::{SyncFolderStatus, SyncService};
pub use status::BackupStatus;
pub use store::{JsonSettingsStore, RelationalStore, SettingsStore, SqliteStore};

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// 安装 fmt 订阅器，默认级别 INFO，可用 `RUST_LOG` 覆盖
///
/// 已有全局订阅器时静默跳过，库代码本身从不调用。
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .try_init();
}
