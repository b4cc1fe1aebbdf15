//! 归档编解码
//!
//! 归档是一个「内部路径 → 字节内容」的扁平映射，底层格式为 ZIP（Deflate）。
//! 归档字节被视为不可信输入：读取时每个条目路径都要先通过校验，
//! 任一条目非法则整个读取失败，且在校验全部通过前不会向磁盘写入任何文件。
//!
//! ## 路径校验规则
//! - 以 `/`、`\` 或盘符（`C:`）开头的绝对路径 → 拒绝
//! - 按分隔符切分，丢弃空段与 `.` 段；出现 `..` 段 → 拒绝
//! - 拼接到解压根目录后必须仍位于根目录之内 → 否则拒绝
//! - 以分隔符结尾的目录条目只创建目录
//! - 符号链接条目跳过并记录警告

use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::backup_common::check_zip_security;
use crate::error::{Result, SyncBackupError};

/// 归档内部固定路径
pub mod entry_paths {
    pub const DATABASE: &str = "database/chat.db";
    pub const SETTINGS: &str = "configs/app-settings.json";
    pub const CUSTOM_PROMPTS: &str = "configs/custom_prompts.json";
    pub const SYSTEM_PROMPTS: &str = "configs/system_prompts.json";
    pub const MCP_SETTINGS: &str = "configs/mcp-settings.json";
    pub const MANIFEST: &str = "manifest.json";
}

/// 解码后的条目集合（规范化路径 → 内容）
pub type ArchiveEntries = BTreeMap<String, Vec<u8>>;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// 按给定顺序编码条目，调用方负责把清单放在最后
pub fn encode_archive(entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for (path, data) in entries {
        writer.start_file(path.as_str(), options)?;
        writer.write_all(data)?;
    }

    Ok(writer.finish()?.into_inner())
}

/// 校验并规范化条目路径
///
/// 返回规范化后的路径段；`Ok(None)` 表示条目规范化后为空（如 `./`），应忽略。
pub fn sanitize_entry_path(name: &str) -> Result<Option<Vec<String>>> {
    if name.starts_with('/') || name.starts_with('\\') || has_drive_prefix(name) {
        warn!("[Archive] 安全警告: 归档包含绝对路径: {}", name);
        return Err(SyncBackupError::UnsafeEntry(name.to_string()));
    }

    let mut segments = Vec::new();
    for segment in name.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => {
                warn!("[Archive] 安全警告: 归档包含路径遍历尝试 (..): {}", name);
                return Err(SyncBackupError::UnsafeEntry(name.to_string()));
            }
            s if s.contains('\0') => {
                return Err(SyncBackupError::UnsafeEntry(name.to_string()));
            }
            s => segments.push(s.to_string()),
        }
    }

    if segments.is_empty() {
        return Ok(None);
    }
    Ok(Some(segments))
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn is_symlink_entry(unix_mode: Option<u32>) -> bool {
    matches!(unix_mode, Some(mode) if mode & S_IFMT == S_IFLNK)
}

/// 解压计划中的单个条目
enum PlannedEntry {
    Directory(PathBuf),
    File { key: String, dest: PathBuf, index: usize },
}

/// 已解压归档：规范化路径 → 磁盘文件
#[derive(Debug)]
pub struct ExtractedArchive {
    pub root: PathBuf,
    pub files: BTreeMap<String, PathBuf>,
}

impl ExtractedArchive {
    pub fn contains(&self, entry: &str) -> bool {
        self.files.contains_key(entry)
    }

    pub fn path_of(&self, entry: &str) -> Option<&Path> {
        self.files.get(entry).map(PathBuf::as_path)
    }

    pub fn read(&self, entry: &str) -> Result<Option<Vec<u8>>> {
        match self.files.get(entry) {
            Some(path) => Ok(Some(fs::read(path)?)),
            None => Ok(None),
        }
    }
}

/// 把归档解压到 `root`
///
/// 先完成容量检查与全部路径校验，再落盘；校验失败时 `root` 中不会产生任何文件。
pub fn extract_archive(archive_bytes: &[u8], root: &Path) -> Result<ExtractedArchive> {
    check_zip_security(archive_bytes)?.validate()?;

    fs::create_dir_all(root)?;
    let root = root.canonicalize()?;

    let mut archive = ZipArchive::new(Cursor::new(archive_bytes))?;
    let mut plan = Vec::with_capacity(archive.len());

    for index in 0..archive.len() {
        let file = archive.by_index_raw(index)?;
        let name = file.name().to_string();

        let Some(segments) = sanitize_entry_path(&name)? else {
            continue;
        };

        let mut dest = root.clone();
        for segment in &segments {
            dest.push(segment);
        }
        if !dest.starts_with(&root) {
            warn!("[Archive] 路径遍历攻击检测: {} -> {:?}", name, dest);
            return Err(SyncBackupError::UnsafeEntry(name));
        }

        if file.is_dir() {
            plan.push(PlannedEntry::Directory(dest));
        } else if is_symlink_entry(file.unix_mode()) {
            warn!("[Archive] 安全警告: 跳过归档中的符号链接条目: {}", name);
        } else {
            plan.push(PlannedEntry::File {
                key: segments.join("/"),
                dest,
                index,
            });
        }
    }

    let mut files = BTreeMap::new();
    for entry in plan {
        match entry {
            PlannedEntry::Directory(dir) => fs::create_dir_all(&dir)?,
            PlannedEntry::File { key, dest, index } => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut file = archive.by_index(index)?;
                let mut out = fs::File::create(&dest)?;
                std::io::copy(&mut file, &mut out)?;
                debug!("[Archive] 解压条目: {} -> {:?}", key, dest);
                files.insert(key, dest);
            }
        }
    }

    Ok(ExtractedArchive { root, files })
}

/// 在内存中解码归档，路径规则与 [`extract_archive`] 相同
pub fn decode_archive(archive_bytes: &[u8]) -> Result<ArchiveEntries> {
    check_zip_security(archive_bytes)?.validate()?;

    let mut archive = ZipArchive::new(Cursor::new(archive_bytes))?;
    let mut keys = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let file = archive.by_index_raw(index)?;
        let Some(segments) = sanitize_entry_path(file.name())? else {
            continue;
        };
        if file.is_dir() || is_symlink_entry(file.unix_mode()) {
            continue;
        }
        keys.push((index, segments.join("/")));
    }

    let mut entries = ArchiveEntries::new();
    for (index, key) in keys {
        let mut file = archive.by_index(index)?;
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)?;
        entries.insert(key, data);
    }
    Ok(entries)
}
