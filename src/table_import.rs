//! 表数据增量导入
//!
//! 把备份库（源）中的行导入在线库（目标），整个导入在目标库的单个事务中完成：
//! 任何一张表失败都会回滚全部已导入的数据。
//!
//! 每张表的导入计划在运行时推导：
//! 1. 目标库不存在同名表 → 跳过（0 行）
//! 2. 取源/目标列名交集，交集为空 → 跳过
//! 3. 目标主键列（按主键序号排序）限定在交集内
//! 4. 有主键 → `ON CONFLICT DO NOTHING`，只跳过键冲突的行并只统计实际写入的行；
//!    无主键 → 直接插入并全部计数。NOT NULL / CHECK 等约束失败一律中止导入
//!
//! 这样在源/目标结构存在差异时无需迁移即可导入，且同一份备份重复导入不会产生新行。

use rusqlite::types::Value;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncBackupError};
use crate::store::open_sqlite;

/// 需要优先导入的表（其它表可能引用它们）
pub const PRIORITY_TABLES: &[&str] = &["conversations"];

/// 导入结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableImportReport {
    /// 每张表实际新增的行数（被跳过的表不出现）
    pub tables: BTreeMap<String, usize>,
    pub total_inserted: usize,
}

/// 单张表的导入计划
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePlan {
    pub table: String,
    /// 源与目标共有的列，保持目标库中的声明顺序
    pub columns: Vec<String>,
    /// 目标主键列（已限定在 `columns` 内，按主键序号排序）
    pub primary_key: Vec<String>,
}

struct ColumnInfo {
    name: String,
    pk: i64,
}

fn quote_identifier(ident: &str) -> Result<String> {
    if ident.is_empty() {
        return Err(SyncBackupError::Database("SQL identifier is empty".to_string()));
    }
    if ident.contains('\0') {
        return Err(SyncBackupError::Database(
            "SQL identifier contains NUL".to_string(),
        ));
    }
    Ok(format!("\"{}\"", ident.replace('"', "\"\"")))
}

/// 系统表与内部元数据表不参与导入
fn is_internal_table(name: &str) -> bool {
    name.starts_with("sqlite_") || name.starts_with("__")
}

fn list_user_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tables
        .into_iter()
        .filter(|name| !is_internal_table(name))
        .collect())
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let sql = format!("PRAGMA table_info({})", quote_identifier(table)?);
    let mut stmt = conn.prepare(&sql)?;
    let columns = stmt
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get(1)?,
                pk: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

/// 计算表的处理顺序：优先表在前，其余按字典序
pub fn import_order(mut tables: Vec<String>) -> Vec<String> {
    tables.sort();
    tables.dedup();
    let mut ordered: Vec<String> = PRIORITY_TABLES
        .iter()
        .filter(|p| tables.iter().any(|t| t == *p))
        .map(|p| p.to_string())
        .collect();
    ordered.extend(
        tables
            .into_iter()
            .filter(|t| !PRIORITY_TABLES.contains(&t.as_str())),
    );
    ordered
}

/// 推导单张表的导入计划，不需要导入时返回 `None`
pub fn plan_table(source: &Connection, target: &Connection, table: &str) -> Result<Option<TablePlan>> {
    if !table_exists(target, table)? {
        debug!("[TableImport] 目标库不存在表 {}，跳过", table);
        return Ok(None);
    }

    let source_columns: HashSet<String> = table_columns(source, table)?
        .into_iter()
        .map(|c| c.name)
        .collect();
    let target_columns = table_columns(target, table)?;

    let columns: Vec<String> = target_columns
        .iter()
        .filter(|c| source_columns.contains(&c.name))
        .map(|c| c.name.clone())
        .collect();
    if columns.is_empty() {
        warn!("[TableImport] 表 {} 源/目标没有共同列，跳过", table);
        return Ok(None);
    }

    let mut pk_columns: Vec<&ColumnInfo> = target_columns
        .iter()
        .filter(|c| c.pk > 0 && source_columns.contains(&c.name))
        .collect();
    pk_columns.sort_by_key(|c| c.pk);

    Ok(Some(TablePlan {
        table: table.to_string(),
        columns,
        primary_key: pk_columns.into_iter().map(|c| c.name.clone()).collect(),
    }))
}

fn import_table(source: &Connection, target: &Connection, plan: &TablePlan) -> Result<usize> {
    let column_list = plan
        .columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    let table_ident = quote_identifier(&plan.table)?;
    let placeholders = (1..=plan.columns.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");

    // 只忽略唯一/主键冲突，其它约束失败要让整个导入回滚
    let conflict_clause = if plan.primary_key.is_empty() {
        ""
    } else {
        " ON CONFLICT DO NOTHING"
    };
    let insert_sql = format!(
        "INSERT INTO {} ({}) VALUES ({}){}",
        table_ident, column_list, placeholders, conflict_clause
    );
    let select_sql = format!("SELECT {} FROM {}", column_list, table_ident);

    let mut select = source.prepare(&select_sql)?;
    let mut insert = target.prepare(&insert_sql)?;
    let width = plan.columns.len();

    let mut inserted = 0usize;
    let mut rows = select.query([])?;
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(row.get::<_, Value>(i)?);
        }
        inserted += insert.execute(rusqlite::params_from_iter(values.iter()))?;
    }
    Ok(inserted)
}

/// 在目标库的一个事务内导入全部表
pub fn import_data(source: &Connection, target: &mut Connection) -> Result<TableImportReport> {
    let order = import_order(list_user_tables(source)?);
    let tx = target.transaction()?;
    let mut report = TableImportReport::default();

    for table in &order {
        let plan = match plan_table(source, &tx, table) {
            Ok(Some(plan)) => plan,
            Ok(None) => continue,
            Err(e) => {
                return Err(SyncBackupError::TableImport {
                    table: table.clone(),
                    message: e.to_string(),
                })
            }
        };

        let inserted =
            import_table(source, &tx, &plan).map_err(|e| SyncBackupError::TableImport {
                table: table.clone(),
                message: e.to_string(),
            })?;

        debug!(
            "[TableImport] {}: {} 行新增（列 {}，主键 {:?}）",
            table,
            inserted,
            plan.columns.len(),
            plan.primary_key
        );
        report.total_inserted += inserted;
        report.tables.insert(table.clone(), inserted);
    }

    tx.commit()?;
    info!(
        "[TableImport] 导入完成: {} 张表，共 {} 行",
        report.tables.len(),
        report.total_inserted
    );
    Ok(report)
}

/// 按文件路径导入，连接在返回前关闭
pub fn import_database_file(
    source_path: &Path,
    target_path: &Path,
    key: Option<&str>,
) -> Result<TableImportReport> {
    let source = open_sqlite(source_path, key)?;
    let mut target = open_sqlite(target_path, key)?;
    import_data(&source, &mut target)
}

/// 统计所有业务表的行数总和
pub fn count_user_rows(conn: &Connection) -> Result<usize> {
    let mut total = 0usize;
    for table in list_user_tables(conn)? {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(&table)?);
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        total += count.max(0) as usize;
    }
    Ok(total)
}
