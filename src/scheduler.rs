//! 防抖备份调度
//!
//! 每次收到“数据已变更”通知都会重置计时器；窗口内没有新的通知时才触发一次备份。
//! 触发时若同步已关闭，或已有备份或恢复在进行，本次直接跳过。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backup_common::safe_lock;
use crate::builder::BackupBuilder;
use crate::store::SettingsStore;

struct PendingBackup {
    generation: u64,
    token: CancellationToken,
}

pub struct BackupScheduler {
    window: Duration,
    settings: Arc<dyn SettingsStore>,
    builder: Arc<BackupBuilder>,
    pending: Mutex<Option<PendingBackup>>,
    generation: AtomicU64,
}

impl BackupScheduler {
    pub fn new(window: Duration, settings: Arc<dyn SettingsStore>, builder: Arc<BackupBuilder>) -> Self {
        Self {
            window,
            settings,
            builder,
            pending: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// 数据变更通知；返回是否（重新）排定了一次备份
    ///
    /// 需要在 tokio 运行时内调用。
    pub fn notify_data_changed(self: &Arc<Self>) -> bool {
        if !self.settings.is_sync_enabled() {
            debug!("[Scheduler] 同步未启用，忽略数据变更通知");
            return false;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("[Scheduler] 当前线程没有 tokio 运行时，无法排定备份: {}", e);
                return false;
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        let previous = safe_lock(&self.pending).replace(PendingBackup {
            generation,
            token: token.clone(),
        });
        if let Some(previous) = previous {
            previous.token.cancel();
        }

        let this = Arc::clone(self);
        handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("[Scheduler] 计时器 #{} 已被取消或重置", generation);
                }
                _ = tokio::time::sleep(this.window) => {
                    this.fire(generation).await;
                }
            }
        });
        debug!(
            "[Scheduler] 已排定备份 #{}，{} 秒后执行",
            generation,
            self.window.as_secs_f32()
        );
        true
    }

    /// 清除待执行的备份，不影响正在进行的备份
    pub fn cancel(&self) -> bool {
        match safe_lock(&self.pending).take() {
            Some(pending) => {
                pending.token.cancel();
                info!("[Scheduler] 已取消待执行的备份 #{}", pending.generation);
                true
            }
            None => false,
        }
    }

    pub fn has_pending(&self) -> bool {
        safe_lock(&self.pending).is_some()
    }

    fn take_if_current(&self, generation: u64) -> bool {
        let mut slot = safe_lock(&self.pending);
        match slot.as_ref() {
            Some(pending) if pending.generation == generation => {
                slot.take();
                true
            }
            _ => false,
        }
    }

    async fn fire(&self, generation: u64) {
        if !self.take_if_current(generation) {
            return;
        }
        if !self.settings.is_sync_enabled() {
            info!("[Scheduler] 同步已关闭，跳过本次定时备份");
            return;
        }
        if self.builder.is_backing_up() {
            info!("[Scheduler] 已有备份在进行，跳过本次定时备份");
            return;
        }

        match self.builder.start_backup().await {
            Ok(Some(info)) => info!("[Scheduler] 定时备份完成: {}", info.filename),
            Ok(None) => info!("[Scheduler] 备份或恢复正在进行，跳过本次定时备份"),
            Err(e) => warn!("[Scheduler] 定时备份失败: {}", e),
        }
    }
}
