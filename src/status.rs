//! 备份状态机
//!
//! `Idle → Preparing → Collecting → Compressing → Finalizing → Idle`，
//! 任一进行中状态都可以进入 `Error`，`Error` 只能回到 `Idle`。
//! 每次转换都会广播前后状态。

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::backup_common::safe_lock;
use crate::events::{Notifier, SyncEvent};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Idle,
    Preparing,
    Collecting,
    Compressing,
    Finalizing,
    Error,
}

impl BackupStatus {
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            BackupStatus::Preparing
                | BackupStatus::Collecting
                | BackupStatus::Compressing
                | BackupStatus::Finalizing
        )
    }

    pub fn can_transition_to(&self, target: BackupStatus) -> bool {
        match self {
            BackupStatus::Idle => target == BackupStatus::Preparing,
            BackupStatus::Preparing => {
                matches!(target, BackupStatus::Collecting | BackupStatus::Error)
            }
            BackupStatus::Collecting => {
                matches!(target, BackupStatus::Compressing | BackupStatus::Error)
            }
            BackupStatus::Compressing => {
                matches!(target, BackupStatus::Finalizing | BackupStatus::Error)
            }
            BackupStatus::Finalizing => {
                matches!(target, BackupStatus::Idle | BackupStatus::Error)
            }
            BackupStatus::Error => target == BackupStatus::Idle,
        }
    }
}

/// 当前状态与最近一次错误
pub struct StatusTracker {
    current: Mutex<BackupStatus>,
    last_error: Mutex<Option<String>>,
    notifier: Arc<Notifier>,
}

impl StatusTracker {
    pub fn new(notifier: Arc<Notifier>) -> Self {
        Self {
            current: Mutex::new(BackupStatus::Idle),
            last_error: Mutex::new(None),
            notifier,
        }
    }

    pub fn current(&self) -> BackupStatus {
        *safe_lock(&self.current)
    }

    pub fn last_error(&self) -> Option<String> {
        safe_lock(&self.last_error).clone()
    }

    /// 执行状态转换并广播；非法转换被忽略并返回 `false`
    pub fn transition(&self, target: BackupStatus) -> bool {
        let previous = {
            let mut current = safe_lock(&self.current);
            let previous = *current;
            if !previous.can_transition_to(target) {
                warn!(
                    "[BackupStatus] 非法状态转换 {:?} -> {:?}，已忽略",
                    previous, target
                );
                return false;
            }
            *current = target;
            previous
        };

        debug!("[BackupStatus] {:?} -> {:?}", previous, target);
        if target == BackupStatus::Preparing {
            *safe_lock(&self.last_error) = None;
        }
        self.notifier.emit(SyncEvent::BackupStatusChanged {
            previous,
            current: target,
        });
        true
    }

    /// 进入 `Error` 并记录消息，随后回到 `Idle`
    pub fn fail(&self, message: impl Into<String>) {
        *safe_lock(&self.last_error) = Some(message.into());
        self.transition(BackupStatus::Error);
        self.transition(BackupStatus::Idle);
    }
}
