use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use postcrew_core::agents::{QuerySummary, Source};
use postcrew_core::ids::{FindingId, ProjectId, RunId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindingRow {
    pub id: FindingId,
    pub project_id: ProjectId,
    pub run_id: RunId,
    pub query: String,
    pub summary: String,
    pub sources: Vec<Source>,
    pub created_at: String,
}

pub struct FindingRepo {
    db: Database,
}

const COLUMNS: &str = "id, project_id, run_id, query, summary, sources, created_at";

impl FindingRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record one finding per query summary, atomically.
    #[instrument(skip(self, summaries), fields(run_id = %run_id, count = summaries.len()))]
    pub fn record(
        &self,
        project_id: &ProjectId,
        run_id: &RunId,
        summaries: &[QuerySummary],
    ) -> Result<Vec<FindingRow>, StoreError> {
        let created_at = Utc::now().to_rfc3339();
        let rows: Vec<FindingRow> = summaries
            .iter()
            .map(|s| FindingRow {
                id: FindingId::new(),
                project_id: project_id.clone(),
                run_id: run_id.clone(),
                query: s.query.clone(),
                summary: s.summary.clone(),
                sources: s.sources.clone(),
                created_at: created_at.clone(),
            })
            .collect();

        self.db.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO research_findings (id, project_id, run_id, query, summary, sources, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for row in &rows {
                stmt.execute(rusqlite::params![
                    row.id.as_str(),
                    row.project_id.as_str(),
                    row.run_id.as_str(),
                    row.query,
                    row.summary,
                    serde_json::to_string(&row.sources)?,
                    row.created_at,
                ])?;
            }
            Ok(())
        })?;
        Ok(rows)
    }

    pub fn list_for_run(&self, run_id: &RunId) -> Result<Vec<FindingRow>, StoreError> {
        self.query(
            &format!("SELECT {COLUMNS} FROM research_findings WHERE run_id = ?1 ORDER BY rowid ASC"),
            run_id.as_str(),
        )
    }

    /// All findings a project has accumulated across runs, oldest first.
    pub fn list_for_project(&self, project_id: &ProjectId) -> Result<Vec<FindingRow>, StoreError> {
        self.query(
            &format!("SELECT {COLUMNS} FROM research_findings WHERE project_id = ?1 ORDER BY rowid ASC"),
            project_id.as_str(),
        )
    }

    fn query(&self, sql: &str, key: &str) -> Result<Vec<FindingRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query([key])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_finding(row)?);
            }
            Ok(out)
        })
    }
}

fn row_to_finding(row: &rusqlite::Row<'_>) -> Result<FindingRow, StoreError> {
    const T: &str = "research_findings";
    let sources: String = row_helpers::get(row, 5, T, "sources")?;
    Ok(FindingRow {
        id: FindingId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        project_id: ProjectId::from_raw(row_helpers::get::<String>(row, 1, T, "project_id")?),
        run_id: RunId::from_raw(row_helpers::get::<String>(row, 2, T, "run_id")?),
        query: row_helpers::get(row, 3, T, "query")?,
        summary: row_helpers::get(row, 4, T, "summary")?,
        sources: row_helpers::parse_json(&sources, T, "sources")?,
        created_at: row_helpers::get(row, 6, T, "created_at")?,
    })
}
