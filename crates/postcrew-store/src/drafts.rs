use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use postcrew_core::ids::{DraftId, ProjectId, RunId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DraftRow {
    pub id: DraftId,
    pub project_id: ProjectId,
    pub run_id: RunId,
    pub version: u32,
    pub content: String,
    pub word_count: u32,
    pub critique_notes: Option<String>,
    pub is_approved: bool,
    pub created_at: String,
}

pub struct DraftRepo {
    db: Database,
}

const COLUMNS: &str =
    "id, project_id, run_id, version, content, word_count, critique_notes, is_approved, created_at";

impl DraftRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a writer output as the run's next version (starting at 1).
    #[instrument(skip(self, content), fields(run_id = %run_id))]
    pub fn create(
        &self,
        project_id: &ProjectId,
        run_id: &RunId,
        content: &str,
        word_count: u32,
    ) -> Result<DraftRow, StoreError> {
        let id = DraftId::new();
        let created_at = Utc::now().to_rfc3339();
        let version = self.db.with_tx(|tx| {
            let next: i64 = tx.query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM post_drafts WHERE run_id = ?1",
                [run_id.as_str()],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO post_drafts (id, project_id, run_id, version, content, word_count, is_approved, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
                rusqlite::params![
                    id.as_str(),
                    project_id.as_str(),
                    run_id.as_str(),
                    next,
                    content,
                    word_count,
                    created_at,
                ],
            )?;
            Ok(next as u32)
        })?;

        Ok(DraftRow {
            id,
            project_id: project_id.clone(),
            run_id: run_id.clone(),
            version,
            content: content.to_string(),
            word_count,
            critique_notes: None,
            is_approved: false,
            created_at,
        })
    }

    /// Attach the critic's notes for this draft.
    pub fn set_critique(&self, id: &DraftId, notes: &str) -> Result<(), StoreError> {
        self.update(
            id,
            "UPDATE post_drafts SET critique_notes = ?1 WHERE id = ?2",
            rusqlite::params![notes, id.as_str()],
        )
    }

    pub fn approve(&self, id: &DraftId) -> Result<(), StoreError> {
        self.update(
            id,
            "UPDATE post_drafts SET is_approved = 1 WHERE id = ?1",
            rusqlite::params![id.as_str()],
        )
    }

    fn update(&self, id: &DraftId, sql: &str, params: impl rusqlite::Params) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            if conn.execute(sql, params)? == 0 {
                return Err(StoreError::not_found("draft", id));
            }
            Ok(())
        })
    }

    /// Drafts of a run in version order.
    pub fn list_for_run(&self, run_id: &RunId) -> Result<Vec<DraftRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM post_drafts WHERE run_id = ?1 ORDER BY version ASC"
            ))?;
            let mut rows = stmt.query([run_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_draft(row)?);
            }
            Ok(out)
        })
    }

    pub fn approved_for_run(&self, run_id: &RunId) -> Result<Option<DraftRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM post_drafts WHERE run_id = ?1 AND is_approved = 1
                 ORDER BY version DESC LIMIT 1"
            ))?;
            let mut rows = stmt.query([run_id.as_str()])?;
            rows.next()?.map(row_to_draft).transpose()
        })
    }
}

fn row_to_draft(row: &rusqlite::Row<'_>) -> Result<DraftRow, StoreError> {
    const T: &str = "post_drafts";
    Ok(DraftRow {
        id: DraftId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        project_id: ProjectId::from_raw(row_helpers::get::<String>(row, 1, T, "project_id")?),
        run_id: RunId::from_raw(row_helpers::get::<String>(row, 2, T, "run_id")?),
        version: row_helpers::get_u32(row, 3, T, "version")?,
        content: row_helpers::get(row, 4, T, "content")?,
        word_count: row_helpers::get_u32(row, 5, T, "word_count")?,
        critique_notes: row_helpers::get_opt(row, 6, T, "critique_notes")?,
        is_approved: row_helpers::get(row, 7, T, "is_approved")?,
        created_at: row_helpers::get(row, 8, T, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projects::tests::new_project;
    use crate::projects::ProjectRepo;
    use crate::runs::RunRepo;

    fn setup() -> (DraftRepo, ProjectId, RunId) {
        let db = Database::in_memory().unwrap();
        let project = ProjectRepo::new(db.clone()).create(&new_project("t")).unwrap();
        let run = RunRepo::new(db.clone()).create_running(&project.id).unwrap();
        (DraftRepo::new(db), project.id, run.id)
    }

    #[test]
    fn versions_increase_per_run() {
        let (repo, project_id, run_id) = setup();
        let v1 = repo.create(&project_id, &run_id, "first draft", 2).unwrap();
        let v2 = repo.create(&project_id, &run_id, "second draft", 2).unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));

        let listed = repo.list_for_run(&run_id).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].content, "second draft");
    }

    #[test]
    fn critique_and_approval() {
        let (repo, project_id, run_id) = setup();
        let draft = repo.create(&project_id, &run_id, "text", 1).unwrap();
        assert!(repo.approved_for_run(&run_id).unwrap().is_none());

        repo.set_critique(&draft.id, "tighten the hook").unwrap();
        repo.approve(&draft.id).unwrap();

        let approved = repo.approved_for_run(&run_id).unwrap().unwrap();
        assert_eq!(approved.id, draft.id);
        assert!(approved.is_approved);
        assert_eq!(approved.critique_notes.as_deref(), Some("tighten the hook"));
    }

    #[test]
    fn approve_missing_draft_is_not_found() {
        let (repo, _, _) = setup();
        let err = repo.approve(&DraftId::from_raw("draft_missing")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
