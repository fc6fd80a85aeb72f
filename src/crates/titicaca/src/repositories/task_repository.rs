//! Task repository for database operations

use super::TaskRepository;
use crate::db::Database;
use crate::error::{Result, TiticacaError};
use crate::models::Task;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::sync::Arc;

const TASK_COLUMNS: &str = "id, type, status, owner, image_id, user_id, request_id, input, result, \
     message, task_time_to_live, expires_at, created_at, updated_at";

/// SQLite-backed task repository
#[derive(Clone, Debug)]
pub struct SqlTaskRepository {
    db: Arc<Database>,
}

impl SqlTaskRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn from_row(row: &SqliteRow) -> Result<Task> {
        let task_type: String = row.try_get("type")?;
        let status: String = row.try_get("status")?;
        let input: String = row.try_get("input")?;
        let result: Option<String> = row.try_get("result")?;

        Ok(Task {
            id: row.try_get("id")?,
            task_type: task_type.parse()?,
            status: status.parse()?,
            owner: row.try_get("owner")?,
            image_id: row.try_get("image_id")?,
            user_id: row.try_get("user_id")?,
            request_id: row.try_get("request_id")?,
            input: serde_json::from_str(&input)?,
            result: result.map(|r| serde_json::from_str(&r)).transpose()?,
            message: row.try_get("message")?,
            task_time_to_live: row.try_get("task_time_to_live")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl TaskRepository for SqlTaskRepository {
    async fn add(&self, task: &Task) -> Result<()> {
        let result_json = task.result.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(&format!(
            "INSERT INTO tasks ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            TASK_COLUMNS
        ))
        .bind(&task.id)
        .bind(task.task_type.as_str())
        .bind(task.status.as_str())
        .bind(&task.owner)
        .bind(&task.image_id)
        .bind(&task.user_id)
        .bind(&task.request_id)
        .bind(serde_json::to_string(&task.input)?)
        .bind(result_json)
        .bind(&task.message)
        .bind(task.task_time_to_live)
        .bind(task.expires_at)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(self.db.pool())
        .await
        .map_err(|e| TiticacaError::Database(format!("Failed to save task: {}", e)))?;

        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Task> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
            .bind(task_id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| TiticacaError::Database(format!("Failed to load task: {}", e)))?
            .ok_or_else(|| TiticacaError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;

        Self::from_row(&row)
    }

    async fn save(&self, task: &Task) -> Result<()> {
        let result_json = task.result.as_ref().map(serde_json::to_string).transpose()?;

        let outcome = sqlx::query(
            "UPDATE tasks
             SET status = ?, image_id = ?, input = ?, result = ?, message = ?,
                 expires_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(task.status.as_str())
        .bind(&task.image_id)
        .bind(serde_json::to_string(&task.input)?)
        .bind(result_json)
        .bind(&task.message)
        .bind(task.expires_at)
        .bind(task.updated_at)
        .bind(&task.id)
        .execute(self.db.pool())
        .await
        .map_err(|e| TiticacaError::Database(format!("Failed to update task: {}", e)))?;

        if outcome.rows_affected() == 0 {
            return Err(TiticacaError::TaskNotFound {
                task_id: task.id.clone(),
            });
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks ORDER BY created_at DESC",
            TASK_COLUMNS
        ))
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| TiticacaError::Database(format!("Failed to list tasks: {}", e)))?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn remove(&self, task_id: &str) -> Result<()> {
        let outcome = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(task_id)
            .execute(self.db.pool())
            .await
            .map_err(|e| TiticacaError::Database(format!("Failed to delete task: {}", e)))?;

        if outcome.rows_affected() == 0 {
            return Err(TiticacaError::TaskNotFound {
                task_id: task_id.to_string(),
            });
        }
        Ok(())
    }
}
