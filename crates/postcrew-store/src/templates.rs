use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use postcrew_core::ids::TemplateId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TemplateRow {
    pub id: TemplateId,
    pub name: String,
    pub tone: String,
    /// Instructions handed to the writer.
    pub structure_prompt: String,
    pub example_post: Option<String>,
    pub created_at: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewTemplate {
    pub name: String,
    #[serde(default = "default_tone")]
    pub tone: String,
    pub structure_prompt: String,
    #[serde(default)]
    pub example_post: Option<String>,
}

fn default_tone() -> String {
    "professional".into()
}

pub struct TemplateRepo {
    db: Database,
}

const COLUMNS: &str = "id, name, tone, structure_prompt, example_post, created_at";

impl TemplateRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, template), fields(name = %template.name))]
    pub fn create(&self, template: &NewTemplate) -> Result<TemplateRow, StoreError> {
        let row = TemplateRow {
            id: TemplateId::new(),
            name: template.name.clone(),
            tone: template.tone.clone(),
            structure_prompt: template.structure_prompt.clone(),
            example_post: template.example_post.clone(),
            created_at: Utc::now().to_rfc3339(),
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO templates (id, name, tone, structure_prompt, example_post, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    row.id.as_str(),
                    row.name,
                    row.tone,
                    row.structure_prompt,
                    row.example_post,
                    row.created_at,
                ],
            )?;
            Ok(())
        })?;
        Ok(row)
    }

    #[instrument(skip(self), fields(template_id = %id))]
    pub fn get(&self, id: &TemplateId) -> Result<TemplateRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM templates WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_template(row),
                None => Err(StoreError::not_found("template", id)),
            }
        })
    }

    pub fn list(&self) -> Result<Vec<TemplateRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM templates ORDER BY created_at DESC"))?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_template(row)?);
            }
            Ok(out)
        })
    }
}

fn row_to_template(row: &rusqlite::Row<'_>) -> Result<TemplateRow, StoreError> {
    const T: &str = "templates";
    Ok(TemplateRow {
        id: TemplateId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        name: row_helpers::get(row, 1, T, "name")?,
        tone: row_helpers::get(row, 2, T, "tone")?,
        structure_prompt: row_helpers::get(row, 3, T, "structure_prompt")?,
        example_post: row_helpers::get_opt(row, 4, T, "example_post")?,
        created_at: row_helpers::get(row, 5, T, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NewTemplate {
        NewTemplate {
            name: "Hot take".into(),
            tone: "controversial".into(),
            structure_prompt: "Open with a bold claim, then three short paragraphs.".into(),
            example_post: None,
        }
    }

    #[test]
    fn create_and_get() {
        let repo = TemplateRepo::new(Database::in_memory().unwrap());
        let created = repo.create(&sample()).unwrap();
        assert!(created.id.as_str().starts_with("tmpl_"));

        let fetched = repo.get(&created.id).unwrap();
        assert_eq!(fetched.name, "Hot take");
        assert_eq!(fetched.tone, "controversial");
        assert!(fetched.example_post.is_none());
    }

    #[test]
    fn get_missing_is_not_found() {
        let repo = TemplateRepo::new(Database::in_memory().unwrap());
        let err = repo.get(&TemplateId::from_raw("tmpl_missing")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn list_returns_all() {
        let repo = TemplateRepo::new(Database::in_memory().unwrap());
        repo.create(&sample()).unwrap();
        repo.create(&sample()).unwrap();
        assert_eq!(repo.list().unwrap().len(), 2);
    }

    #[test]
    fn new_template_tone_defaults() {
        let t: NewTemplate = serde_json::from_str(r#"{"name":"n","structure_prompt":"p"}"#).unwrap();
        assert_eq!(t.tone, "professional");
    }
}
