use anyhow::{Context, Result};
use rusqlite::{params, ErrorCode, OptionalExtension};
use std::{thread, time::Duration};

use crate::config::Settings;

pub use rusqlite::Connection;

const TELEMETRY_KEY: &str = "POE_BRIDGE_TELEMETRY";
const DEFAULT_MODEL_KEY: &str = "POE_BRIDGE_DEFAULT_MODEL";

/**
 * \brief 打开默认设置库（当前目录下的 poe-bridge.db，可用 POE_BRIDGE_DB 覆盖路径）。
 */
pub fn open_default_db() -> Result<Connection> {
    let path = std::env::var("POE_BRIDGE_DB").unwrap_or_else(|_| "poe-bridge.db".to_string());
    let conn = Connection::open(&path).with_context(|| format!("open {} failed", path))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

/**
 * \brief 写入一项设置（键通常为环境变量名，如 POE_API_KEY）。
 */
pub fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

pub fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val)
}

pub fn delete_setting(conn: &Connection, key: &str) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM app_config WHERE key=?1", params![key]))?;
    Ok(())
}

/**
 * \brief 读取全部持久化设置，用于回答 Vendor 的设置问题。
 */
pub fn load_settings(conn: &Connection) -> Result<Settings> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut pairs = Vec::new();
    for row in rows {
        pairs.push(row?);
    }
    Ok(Settings::from_pairs(pairs))
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    set_setting(conn, key, if value { "1" } else { "0" })
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    Ok(get_setting(conn, key)?.map(|s| s == "1").unwrap_or(default))
}

pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, TELEMETRY_KEY, false)
}

pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, TELEMETRY_KEY, enabled)
}

/**
 * \brief 读取默认模型（CLI 未指定 --model 时使用）。
 */
pub fn get_default_model(conn: &Connection) -> Result<Option<String>> {
    Ok(get_setting(conn, DEFAULT_MODEL_KEY)?.filter(|m| !m.is_empty()))
}

pub fn set_default_model(conn: &Connection, model: &str) -> Result<()> {
    set_setting(conn, DEFAULT_MODEL_KEY, model)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
