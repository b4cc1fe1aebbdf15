//! 生命周期通知
//!
//! 引擎不依赖全局事件总线，而是持有一个 [`Notifier`]：
//! - [`EventSink`]：接收备份/导入生命周期事件
//! - [`UiHost`]：刷新会话列表、收起窗口、在文件管理器中打开目录
//!
//! 每类观察者最多注册一个，重复注册替换旧的。投递是即发即忘的：
//! 观察者 panic 会被捕获并记录，不影响备份/恢复流程。

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};

use crate::builder::BackupInfo;
use crate::error::Result;
use crate::restore::ImportMode;
use crate::status::BackupStatus;

/// 对外广播的事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    BackupStarted {
        job_id: String,
    },
    BackupCompleted {
        job_id: String,
        info: BackupInfo,
    },
    BackupError {
        job_id: String,
        message_key: String,
        message: String,
    },
    BackupStatusChanged {
        previous: BackupStatus,
        current: BackupStatus,
    },
    ImportStarted {
        filename: String,
        mode: ImportMode,
    },
    ImportCompleted {
        filename: String,
        mode: ImportMode,
        affected_count: usize,
    },
    ImportError {
        filename: String,
        message_key: String,
        message: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &SyncEvent);
}

pub trait UiHost: Send + Sync {
    /// 重新加载内存中的会话/线程列表
    fn refresh_sessions(&self);
    /// 把所有窗口收起为单个空白标签页
    fn collapse_windows(&self);
    fn reveal_folder(&self, path: &Path) -> Result<()>;
}

/// 默认事件接收者：只写日志
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &SyncEvent) {
        match event {
            SyncEvent::BackupError { message, .. } | SyncEvent::ImportError { message, .. } => {
                warn!("[Event] {:?} ({})", event, message)
            }
            _ => info!("[Event] {:?}", event),
        }
    }
}

pub struct NoopUiHost;

impl UiHost for NoopUiHost {
    fn refresh_sessions(&self) {}

    fn collapse_windows(&self) {}

    fn reveal_folder(&self, path: &Path) -> Result<()> {
        info!("[Event] 同步目录: {}", path.display());
        Ok(())
    }
}

pub struct Notifier {
    sink: RwLock<Arc<dyn EventSink>>,
    ui: RwLock<Arc<dyn UiHost>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(Arc::new(TracingEventSink), Arc::new(NoopUiHost))
    }
}

impl Notifier {
    pub fn new(sink: Arc<dyn EventSink>, ui: Arc<dyn UiHost>) -> Self {
        Self {
            sink: RwLock::new(sink),
            ui: RwLock::new(ui),
        }
    }

    pub fn register_sink(&self, sink: Arc<dyn EventSink>) {
        match self.sink.write() {
            Ok(mut slot) => *slot = sink,
            Err(poisoned) => *poisoned.into_inner() = sink,
        }
    }

    pub fn register_ui(&self, ui: Arc<dyn UiHost>) {
        match self.ui.write() {
            Ok(mut slot) => *slot = ui,
            Err(poisoned) => *poisoned.into_inner() = ui,
        }
    }

    fn current_sink(&self) -> Arc<dyn EventSink> {
        match self.sink.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn current_ui(&self) -> Arc<dyn UiHost> {
        match self.ui.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn emit(&self, event: SyncEvent) {
        let sink = self.current_sink();
        if catch_unwind(AssertUnwindSafe(|| sink.emit(&event))).is_err() {
            error!("[Event] 事件接收者 panic，已忽略: {:?}", event);
        }
    }

    pub fn refresh_sessions(&self) {
        let ui = self.current_ui();
        if catch_unwind(AssertUnwindSafe(|| ui.refresh_sessions())).is_err() {
            error!("[Event] refresh_sessions panic，已忽略");
        }
    }

    pub fn collapse_windows(&self) {
        let ui = self.current_ui();
        if catch_unwind(AssertUnwindSafe(|| ui.collapse_windows())).is_err() {
            error!("[Event] collapse_windows panic，已忽略");
        }
    }

    pub fn reveal_folder(&self, path: &Path) -> Result<()> {
        self.current_ui().reveal_folder(path)
    }
}
