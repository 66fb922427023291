use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use postcrew_core::agents::{GroundednessOutcome, MAX_GROUNDEDNESS_SCORE};
use postcrew_core::ids::{ProjectId, ReportId, RunId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportRow {
    pub id: ReportId,
    pub project_id: ProjectId,
    pub run_id: RunId,
    pub supported: Vec<String>,
    pub unsupported: Vec<String>,
    pub score: u8,
    pub notes: String,
    pub created_at: String,
}

pub struct ReportRepo {
    db: Database,
}

const COLUMNS: &str = "id, project_id, run_id, supported, unsupported, score, notes, created_at";

impl ReportRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a report and make it the project's current one. Older reports
    /// stay in history but no longer back the project's score.
    #[instrument(skip(self, outcome), fields(run_id = %run_id, score = outcome.score))]
    pub fn create(
        &self,
        project_id: &ProjectId,
        run_id: &RunId,
        outcome: &GroundednessOutcome,
    ) -> Result<ReportRow, StoreError> {
        if outcome.score > MAX_GROUNDEDNESS_SCORE {
            return Err(StoreError::Conflict(format!(
                "groundedness score {} exceeds {MAX_GROUNDEDNESS_SCORE}",
                outcome.score
            )));
        }

        let row = ReportRow {
            id: ReportId::new(),
            project_id: project_id.clone(),
            run_id: run_id.clone(),
            supported: outcome.supported.clone(),
            unsupported: outcome.unsupported.clone(),
            score: outcome.score,
            notes: outcome.notes.clone(),
            created_at: Utc::now().to_rfc3339(),
        };
        let supported = serde_json::to_string(&row.supported)?;
        let unsupported = serde_json::to_string(&row.unsupported)?;

        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO groundedness_reports (id, project_id, run_id, supported, unsupported, score, notes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    row.id.as_str(),
                    project_id.as_str(),
                    run_id.as_str(),
                    supported,
                    unsupported,
                    row.score,
                    row.notes,
                    row.created_at,
                ],
            )?;
            let changed = tx.execute(
                "UPDATE projects SET groundedness_score = ?1, current_report_id = ?2, updated_at = ?3
                 WHERE id = ?4",
                rusqlite::params![row.score, row.id.as_str(), row.created_at, project_id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("project", project_id));
            }
            Ok(())
        })?;
        Ok(row)
    }

    pub fn get(&self, id: &ReportId) -> Result<ReportRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM groundedness_reports WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_report(row),
                None => Err(StoreError::not_found("report", id)),
            }
        })
    }

    /// The report currently backing the project's score.
    pub fn current_for_project(&self, project_id: &ProjectId) -> Result<Option<ReportRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM groundedness_reports
                 WHERE id = (SELECT current_report_id FROM projects WHERE id = ?1)"
            ))?;
            let mut rows = stmt.query([project_id.as_str()])?;
            rows.next()?.map(row_to_report).transpose()
        })
    }

    /// Oldest first.
    pub fn list_for_run(&self, run_id: &RunId) -> Result<Vec<ReportRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM groundedness_reports WHERE run_id = ?1 ORDER BY rowid ASC"
            ))?;
            let mut rows = stmt.query([run_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_report(row)?);
            }
            Ok(out)
        })
    }
}

fn row_to_report(row: &rusqlite::Row<'_>) -> Result<ReportRow, StoreError> {
    const T: &str = "groundedness_reports";
    let supported: String = row_helpers::get(row, 3, T, "supported")?;
    let unsupported: String = row_helpers::get(row, 4, T, "unsupported")?;
    let score = row_helpers::get_u32(row, 5, T, "score")?;
    Ok(ReportRow {
        id: ReportId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        project_id: ProjectId::from_raw(row_helpers::get::<String>(row, 1, T, "project_id")?),
        run_id: RunId::from_raw(row_helpers::get::<String>(row, 2, T, "run_id")?),
        supported: row_helpers::parse_json(&supported, T, "supported")?,
        unsupported: row_helpers::parse_json(&unsupported, T, "unsupported")?,
        score: u8::try_from(score).map_err(|_| StoreError::CorruptRow {
            table: T,
            column: "score",
            detail: format!("{score} out of range"),
        })?,
        notes: row_helpers::get(row, 6, T, "notes")?,
        created_at: row_helpers::get(row, 7, T, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projects::tests::new_project;
    use crate::projects::ProjectRepo;
    use crate::runs::RunRepo;

    fn outcome(score: u8) -> GroundednessOutcome {
        GroundednessOutcome {
            supported: vec!["Rust 1.0 shipped in 2015".into()],
            unsupported: vec!["everyone uses Rust".into()],
            score,
            notes: "one overreach".into(),
        }
    }

    #[test]
    fn newer_report_supersedes_project_score() {
        let db = Database::in_memory().unwrap();
        let projects = ProjectRepo::new(db.clone());
        let project = projects.create(&new_project("t")).unwrap();
        let run = RunRepo::new(db.clone()).create_running(&project.id).unwrap();
        let repo = ReportRepo::new(db);

        let first = repo.create(&project.id, &run.id, &outcome(3)).unwrap();
        let second = repo.create(&project.id, &run.id, &outcome(5)).unwrap();

        let fetched = projects.get(&project.id).unwrap();
        assert_eq!(fetched.groundedness_score, Some(5));
        assert_eq!(fetched.current_report_id.as_ref(), Some(&second.id));

        let current = repo.current_for_project(&project.id).unwrap().unwrap();
        assert_eq!(current.id, second.id);
        assert_eq!(current.unsupported, vec!["everyone uses Rust"]);

        // History is kept.
        assert_eq!(repo.get(&first.id).unwrap().score, 3);
        assert_eq!(repo.list_for_run(&run.id).unwrap().len(), 2);
    }

    #[test]
    fn score_above_scale_is_rejected() {
        let db = Database::in_memory().unwrap();
        let project = ProjectRepo::new(db.clone()).create(&new_project("t")).unwrap();
        let run = RunRepo::new(db.clone()).create_running(&project.id).unwrap();
        let repo = ReportRepo::new(db);
        assert!(repo.create(&project.id, &run.id, &outcome(6)).is_err());
        assert!(repo.current_for_project(&project.id).unwrap().is_none());
    }
}
