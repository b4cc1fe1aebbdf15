//! 备份清单
//!
//! 清单在构建归档时最后写入，它的存在意味着归档完整。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::archive::ExtractedArchive;
use crate::backup_common::calculate_bytes_hash;
use crate::error::{Result, SyncBackupError};

/// 当前归档格式版本
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub version: u32,
    /// 创建时间（Unix 毫秒）
    pub created_at: i64,
    /// 生成此备份的引擎版本
    #[serde(default)]
    pub app_version: String,
    /// 归档中的条目路径（不含清单自身）
    pub entries: Vec<String>,
    /// 条目 SHA256（旧归档可能没有）
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checksums: BTreeMap<String, String>,
}

impl BackupManifest {
    pub fn new(created_at: i64) -> Self {
        Self {
            version: MANIFEST_FORMAT_VERSION,
            created_at,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            entries: Vec::new(),
            checksums: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, path: &str, data: &[u8]) {
        self.entries.push(path.to_string());
        self.checksums
            .insert(path.to_string(), calculate_bytes_hash(data));
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// 校验格式版本与已解压条目的校验和
    ///
    /// 清单中列出但未解压出来的条目不在这里判定，必需条目由恢复引擎单独检查。
    pub fn verify(&self, extracted: &ExtractedArchive) -> Result<()> {
        if self.version > MANIFEST_FORMAT_VERSION {
            return Err(SyncBackupError::UnsupportedVersion(self.version));
        }

        for (path, expected) in &self.checksums {
            let Some(data) = extracted.read(path)? else {
                continue;
            };
            let actual = calculate_bytes_hash(&data);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(SyncBackupError::ChecksumMismatch {
                    path: path.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }
}
