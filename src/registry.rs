//! 操作员 / 群目标注册表
//!
//! 按实体分表的简单键值存储：operators、groups、settings。
//! 群只做软删除（清活跃位），保留审计历史；活跃群的频道 ID 全局唯一。

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::RelayError;

/// 控制端主体（首次来消息时创建，档案变化时更新，从不删除）
#[derive(Debug, Clone)]
pub struct Operator {
    pub id: i64,
    pub external_id: String,
    pub display_name: Option<String>,
    pub is_authenticated: bool,
}

/// 群发目标
#[derive(Debug, Clone)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub channel_id: String,
    pub owner_id: i64,
    pub is_active: bool,
}

/// 注册表契约；状态机只通过这里读写持久化实体
#[async_trait]
pub trait GroupRegistry: Send + Sync {
    /// 查找或创建操作员；显示名变化时顺带更新
    async fn ensure_operator(
        &self,
        external_id: &str,
        display_name: Option<&str>,
    ) -> Result<Operator, RelayError>;

    /// 操作员的活跃群，按创建顺序
    async fn list_groups(&self, owner_id: i64) -> Result<Vec<Group>, RelayError>;

    async fn create_group(
        &self,
        owner_id: i64,
        name: &str,
        channel_id: &str,
    ) -> Result<Group, RelayError>;

    /// 软删除：清活跃位，行保留
    async fn soft_delete_group(&self, group_id: i64) -> Result<(), RelayError>;

    /// 操作员的群发间隔（毫秒），未设置时用默认值
    async fn send_rate_ms(&self, operator_id: i64) -> Result<u64, RelayError>;

    async fn set_send_rate_ms(&self, operator_id: i64, rate_ms: u64) -> Result<(), RelayError>;
}

/// SQLite 实现（同步连接 + 互斥锁，语句都很短）
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
    default_rate_ms: u64,
}

impl SqliteRegistry {
    pub fn open(path: impl AsRef<Path>, default_rate_ms: u64) -> Result<Self, RelayError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, default_rate_ms)
    }

    pub fn open_in_memory(default_rate_ms: u64) -> Result<Self, RelayError> {
        Self::with_connection(Connection::open_in_memory()?, default_rate_ms)
    }

    fn with_connection(conn: Connection, default_rate_ms: u64) -> Result<Self, RelayError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS operators (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                external_id TEXT UNIQUE NOT NULL,
                display_name TEXT,
                is_authenticated INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                owner_id INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (owner_id) REFERENCES operators (id)
            );
            CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operator_id INTEGER UNIQUE NOT NULL,
                send_rate_ms INTEGER NOT NULL,
                FOREIGN KEY (operator_id) REFERENCES operators (id)
            );
            CREATE INDEX IF NOT EXISTS idx_operators_external ON operators (external_id);
            CREATE INDEX IF NOT EXISTS idx_groups_owner ON groups (owner_id);
            CREATE INDEX IF NOT EXISTS idx_groups_channel ON groups (channel_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            default_rate_ms,
        })
    }

    /// 取连接锁；持锁线程 panic 只会留下毒标记，连接本身仍可用
    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 探针用：连接还能跑最小查询
    pub fn is_healthy(&self) -> bool {
        self.lock_conn()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }
}

fn map_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get("id")?,
        name: row.get("name")?,
        channel_id: row.get("channel_id")?,
        owner_id: row.get("owner_id")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
    })
}

fn map_operator(row: &rusqlite::Row<'_>) -> rusqlite::Result<Operator> {
    Ok(Operator {
        id: row.get("id")?,
        external_id: row.get("external_id")?,
        display_name: row.get("display_name")?,
        is_authenticated: row.get::<_, i64>("is_authenticated")? != 0,
    })
}

#[async_trait]
impl GroupRegistry for SqliteRegistry {
    async fn ensure_operator(
        &self,
        external_id: &str,
        display_name: Option<&str>,
    ) -> Result<Operator, RelayError> {
        let conn = self.lock_conn();

        let existing = conn
            .query_row(
                "SELECT id, external_id, display_name, is_authenticated
                 FROM operators WHERE external_id = ?1",
                params![external_id],
                map_operator,
            )
            .optional()?;

        if let Some(operator) = existing {
            if operator.display_name.as_deref() != display_name {
                conn.execute(
                    "UPDATE operators SET display_name = ?1, updated_at = CURRENT_TIMESTAMP
                     WHERE id = ?2",
                    params![display_name, operator.id],
                )?;
                tracing::debug!(external_id, "operator profile updated");
                return Ok(Operator {
                    display_name: display_name.map(str::to_string),
                    ..operator
                });
            }
            return Ok(operator);
        }

        conn.execute(
            "INSERT INTO operators (external_id, display_name) VALUES (?1, ?2)",
            params![external_id, display_name],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(external_id, "operator created");
        Ok(Operator {
            id,
            external_id: external_id.to_string(),
            display_name: display_name.map(str::to_string),
            is_authenticated: false,
        })
    }

    async fn list_groups(&self, owner_id: i64) -> Result<Vec<Group>, RelayError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, channel_id, owner_id, is_active
             FROM groups WHERE owner_id = ?1 AND is_active = 1
             ORDER BY id",
        )?;
        let groups = stmt
            .query_map(params![owner_id], map_group)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    async fn create_group(
        &self,
        owner_id: i64,
        name: &str,
        channel_id: &str,
    ) -> Result<Group, RelayError> {
        let conn = self.lock_conn();

        let taken: i64 = conn.query_row(
            "SELECT COUNT(*) FROM groups WHERE channel_id = ?1 AND is_active = 1",
            params![channel_id],
            |row| row.get(0),
        )?;
        if taken > 0 {
            return Err(RelayError::DuplicateChannel(channel_id.to_string()));
        }

        conn.execute(
            "INSERT INTO groups (name, channel_id, owner_id, is_active) VALUES (?1, ?2, ?3, 1)",
            params![name, channel_id, owner_id],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(group = name, channel_id, "group registered");
        Ok(Group {
            id,
            name: name.to_string(),
            channel_id: channel_id.to_string(),
            owner_id,
            is_active: true,
        })
    }

    async fn soft_delete_group(&self, group_id: i64) -> Result<(), RelayError> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE groups SET is_active = 0, updated_at = CURRENT_TIMESTAMP WHERE id = ?1",
            params![group_id],
        )?;
        Ok(())
    }

    async fn send_rate_ms(&self, operator_id: i64) -> Result<u64, RelayError> {
        let conn = self.lock_conn();
        let rate = conn
            .query_row(
                "SELECT send_rate_ms FROM settings WHERE operator_id = ?1",
                params![operator_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(rate.map(|r| r as u64).unwrap_or(self.default_rate_ms))
    }

    async fn set_send_rate_ms(&self, operator_id: i64, rate_ms: u64) -> Result<(), RelayError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO settings (operator_id, send_rate_ms) VALUES (?1, ?2)
             ON CONFLICT(operator_id) DO UPDATE SET send_rate_ms = excluded.send_rate_ms",
            params![operator_id, rate_ms as i64],
        )?;
        Ok(())
    }
}
