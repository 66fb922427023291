use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use postcrew_core::ids::{ProjectId, RunId};

use crate::database::Database;
use crate::error::{is_constraint_violation, StoreError};
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One orchestration attempt for a project.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRow {
    pub id: RunId,
    pub project_id: ProjectId,
    pub status: RunStatus,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub total_revisions: u32,
    pub error_message: Option<String>,
}

const COLUMNS: &str =
    "id, project_id, status, started_at, completed_at, total_revisions, error_message";

pub struct RunRepo {
    db: Database,
}

impl RunRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a run in `running` state. Fails with `Conflict` if the project
    /// already has a running run.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub fn create_running(&self, project_id: &ProjectId) -> Result<RunRow, StoreError> {
        let row = RunRow {
            id: RunId::new(),
            project_id: project_id.clone(),
            status: RunStatus::Running,
            started_at: Utc::now().to_rfc3339(),
            completed_at: None,
            total_revisions: 0,
            error_message: None,
        };
        self.db.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM projects WHERE id = ?1)",
                [project_id.as_str()],
                |r| r.get(0),
            )?;
            if !exists {
                return Err(StoreError::not_found("project", project_id));
            }
            conn.execute(
                "INSERT INTO agent_runs (id, project_id, status, started_at, total_revisions)
                 VALUES (?1, ?2, 'running', ?3, 0)",
                rusqlite::params![row.id.as_str(), project_id.as_str(), row.started_at],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    StoreError::Conflict(format!("project {project_id} already has a running run"))
                } else {
                    StoreError::from(e)
                }
            })?;
            Ok(())
        })?;
        Ok(row)
    }

    #[instrument(skip(self), fields(run_id = %id))]
    pub fn get(&self, id: &RunId) -> Result<RunRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM agent_runs WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_run(row),
                None => Err(StoreError::not_found("run", id)),
            }
        })
    }

    /// Newest first.
    pub fn list_for_project(&self, project_id: &ProjectId) -> Result<Vec<RunRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM agent_runs WHERE project_id = ?1 ORDER BY rowid DESC"
            ))?;
            let mut rows = stmt.query([project_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_run(row)?);
            }
            Ok(out)
        })
    }

    /// Most recent completed run of a project, if any.
    pub fn latest_completed(&self, project_id: &ProjectId) -> Result<Option<RunRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM agent_runs WHERE project_id = ?1 AND status = 'completed'
                 ORDER BY rowid DESC LIMIT 1"
            ))?;
            let mut rows = stmt.query([project_id.as_str()])?;
            rows.next()?.map(row_to_run).transpose()
        })
    }

    #[instrument(skip(self), fields(run_id = %id))]
    pub fn set_revisions(&self, id: &RunId, total_revisions: u32) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE agent_runs SET total_revisions = ?1 WHERE id = ?2 AND status = 'running'",
                rusqlite::params![total_revisions, id.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(run_id = %id))]
    pub fn complete(&self, id: &RunId, total_revisions: u32) -> Result<(), StoreError> {
        let changed = self.finish(id, RunStatus::Completed, Some(total_revisions), None)?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!("run {id} is not running")));
        }
        Ok(())
    }

    /// Mark a running run failed. A run that already ended is left untouched.
    #[instrument(skip(self), fields(run_id = %id))]
    pub fn fail(&self, id: &RunId, error_message: &str) -> Result<(), StoreError> {
        self.finish(id, RunStatus::Failed, None, Some(error_message))?;
        Ok(())
    }

    // Only a running run may transition; terminal rows are never rewritten.
    fn finish(
        &self,
        id: &RunId,
        status: RunStatus,
        total_revisions: Option<u32>,
        error_message: Option<&str>,
    ) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE agent_runs
                 SET status = ?1, completed_at = ?2,
                     total_revisions = COALESCE(?3, total_revisions), error_message = ?4
                 WHERE id = ?5 AND status = 'running'",
                rusqlite::params![
                    status.as_str(),
                    Utc::now().to_rfc3339(),
                    total_revisions,
                    error_message,
                    id.as_str()
                ],
            )?)
        })
    }

    /// Fail every run left `running` by a previous process.
    #[instrument(skip(self))]
    pub fn fail_stale_running(&self, reason: &str) -> Result<usize, StoreError> {
        let count = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE agent_runs SET status = 'failed', completed_at = ?1, error_message = ?2
                 WHERE status = 'running'",
                rusqlite::params![Utc::now().to_rfc3339(), reason],
            )?)
        })?;
        if count > 0 {
            warn!(count, "marked stale running runs as failed");
        }
        Ok(count)
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> Result<RunRow, StoreError> {
    const T: &str = "agent_runs";
    let status: String = row_helpers::get(row, 2, T, "status")?;
    Ok(RunRow {
        id: RunId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        project_id: ProjectId::from_raw(row_helpers::get::<String>(row, 1, T, "project_id")?),
        status: row_helpers::parse_enum(&status, T, "status")?,
        started_at: row_helpers::get(row, 3, T, "started_at")?,
        completed_at: row_helpers::get_opt(row, 4, T, "completed_at")?,
        total_revisions: row_helpers::get_u32(row, 5, T, "total_revisions")?,
        error_message: row_helpers::get_opt(row, 6, T, "error_message")?,
    })
}
