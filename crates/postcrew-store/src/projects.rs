use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use postcrew_core::ids::{ProjectId, ReportId, TemplateId};
use postcrew_core::project::{ProjectBrief, WordRange, DEFAULT_LANGUAGE, DEFAULT_WORD_MAX, DEFAULT_WORD_MIN};

use crate::database::Database;
use crate::error::{is_constraint_violation, StoreError};
use crate::row_helpers;
use crate::templates::TemplateRepo;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Draft,
    Researching,
    Writing,
    Reviewing,
    Approved,
    Published,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Researching => "researching",
            Self::Writing => "writing",
            Self::Reviewing => "reviewing",
            Self::Approved => "approved",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProjectStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "researching" => Ok(Self::Researching),
            "writing" => Ok(Self::Writing),
            "reviewing" => Ok(Self::Reviewing),
            "approved" => Ok(Self::Approved),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown project status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectRow {
    pub id: ProjectId,
    pub title: String,
    pub topic: String,
    pub tone: String,
    pub target_audience: String,
    pub word_count_min: u32,
    pub word_count_max: u32,
    pub language: String,
    pub include_hashtags: bool,
    pub include_cta: bool,
    pub include_emoji: bool,
    pub template_id: Option<TemplateId>,
    pub status: ProjectStatus,
    pub final_post: Option<String>,
    pub groundedness_score: Option<u8>,
    pub current_report_id: Option<ReportId>,
    pub is_favorite: bool,
    pub published_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Project creation payload.
#[derive(Clone, Debug, Deserialize)]
pub struct NewProject {
    pub title: String,
    pub topic: String,
    #[serde(default = "default_tone")]
    pub tone: String,
    #[serde(default)]
    pub target_audience: String,
    #[serde(default = "default_min")]
    pub word_count_min: u32,
    #[serde(default = "default_max")]
    pub word_count_max: u32,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "yes")]
    pub include_hashtags: bool,
    #[serde(default = "yes")]
    pub include_cta: bool,
    #[serde(default)]
    pub include_emoji: bool,
    #[serde(default)]
    pub template_id: Option<TemplateId>,
}

fn default_tone() -> String {
    "professional".into()
}
fn default_min() -> u32 {
    DEFAULT_WORD_MIN
}
fn default_max() -> u32 {
    DEFAULT_WORD_MAX
}
fn default_language() -> String {
    DEFAULT_LANGUAGE.into()
}
fn yes() -> bool {
    true
}

impl NewProject {
    pub fn validate(&self) -> Result<(), String> {
        if self.topic.trim().is_empty() {
            return Err("topic must not be empty".into());
        }
        if self.word_count_min == 0 || self.word_count_min > self.word_count_max {
            return Err(format!(
                "invalid word count range {}..{}",
                self.word_count_min, self.word_count_max
            ));
        }
        Ok(())
    }
}

const COLUMNS: &str = "id, title, topic, tone, target_audience, word_count_min, word_count_max, language,
    include_hashtags, include_cta, include_emoji, template_id, status, final_post, groundedness_score,
    current_report_id, created_at, updated_at, is_favorite, published_at";

pub struct ProjectRepo {
    db: Database,
}

impl ProjectRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, project), fields(title = %project.title))]
    pub fn create(&self, project: &NewProject) -> Result<ProjectRow, StoreError> {
        let now = Utc::now().to_rfc3339();
        let row = ProjectRow {
            id: ProjectId::new(),
            title: project.title.clone(),
            topic: project.topic.clone(),
            tone: project.tone.clone(),
            target_audience: project.target_audience.clone(),
            word_count_min: project.word_count_min,
            word_count_max: project.word_count_max,
            language: project.language.clone(),
            include_hashtags: project.include_hashtags,
            include_cta: project.include_cta,
            include_emoji: project.include_emoji,
            template_id: project.template_id.clone(),
            status: ProjectStatus::Draft,
            final_post: None,
            groundedness_score: None,
            current_report_id: None,
            is_favorite: false,
            published_at: None,
            created_at: now.clone(),
            updated_at: now,
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO projects (id, title, topic, tone, target_audience, word_count_min, word_count_max,
                     language, include_hashtags, include_cta, include_emoji, template_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 'draft', ?13, ?14)",
                rusqlite::params![
                    row.id.as_str(),
                    row.title,
                    row.topic,
                    row.tone,
                    row.target_audience,
                    row.word_count_min,
                    row.word_count_max,
                    row.language,
                    row.include_hashtags,
                    row.include_cta,
                    row.include_emoji,
                    row.template_id.as_ref().map(|t| t.as_str()),
                    row.created_at,
                    row.updated_at,
                ],
            )
            .map_err(|e| match (&row.template_id, is_constraint_violation(&e)) {
                (Some(template_id), true) => StoreError::not_found("template", template_id),
                _ => StoreError::from(e),
            })?;
            Ok(())
        })?;
        Ok(row)
    }

    #[instrument(skip(self), fields(project_id = %id))]
    pub fn get(&self, id: &ProjectId) -> Result<ProjectRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM projects WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_project(row),
                None => Err(StoreError::not_found("project", id)),
            }
        })
    }

    pub fn list(&self, limit: u32) -> Result<Vec<ProjectRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM projects ORDER BY created_at DESC LIMIT ?1"
            ))?;
            let mut rows = stmt.query([limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_project(row)?);
            }
            Ok(out)
        })
    }

    #[instrument(skip(self), fields(project_id = %id, status = %status))]
    pub fn set_status(&self, id: &ProjectId, status: ProjectStatus) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.as_str(), Utc::now().to_rfc3339(), id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("project", id));
            }
            Ok(())
        })
    }

    /// Store the approved post and mark the project approved.
    #[instrument(skip(self, final_post), fields(project_id = %id))]
    pub fn set_final_post(&self, id: &ProjectId, final_post: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE projects SET final_post = ?1, status = 'approved', updated_at = ?2 WHERE id = ?3",
                rusqlite::params![final_post, Utc::now().to_rfc3339(), id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("project", id));
            }
            Ok(())
        })
    }

    /// Flip the favorite flag and return its new value.
    #[instrument(skip(self), fields(project_id = %id))]
    pub fn toggle_favorite(&self, id: &ProjectId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE projects SET is_favorite = 1 - is_favorite, updated_at = ?1 WHERE id = ?2",
                rusqlite::params![Utc::now().to_rfc3339(), id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("project", id));
            }
            let favorite = conn.query_row("SELECT is_favorite FROM projects WHERE id = ?1", [id.as_str()], |row| {
                row.get::<_, bool>(0)
            })?;
            Ok(favorite)
        })
    }

    /// Mark an approved project published. Publishing again keeps the first
    /// timestamp.
    #[instrument(skip(self), fields(project_id = %id))]
    pub fn publish(&self, id: &ProjectId) -> Result<ProjectRow, StoreError> {
        let project = self.get(id)?;
        let has_post = project.final_post.is_some();
        match project.status {
            ProjectStatus::Published => return Ok(project),
            ProjectStatus::Approved if has_post => {}
            other => {
                return Err(StoreError::Conflict(format!(
                    "project {id} is {other}, only approved posts can be published"
                )))
            }
        }
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE projects SET status = 'published', published_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status = 'approved'",
                rusqlite::params![now, id.as_str()],
            )?;
            Ok(())
        })?;
        self.get(id)
    }

    /// Replace the final post with a hand-edited version. The project must
    /// already have one.
    #[instrument(skip(self, content), fields(project_id = %id))]
    pub fn update_post(&self, id: &ProjectId, content: &str) -> Result<ProjectRow, StoreError> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE projects SET final_post = ?1, updated_at = ?2 WHERE id = ?3 AND final_post IS NOT NULL",
                rusqlite::params![content, Utc::now().to_rfc3339(), id.as_str()],
            )?)
        })?;
        if changed == 0 {
            self.get(id)?;
            return Err(StoreError::Conflict(format!("project {id} has no final post to edit")));
        }
        self.get(id)
    }

    /// Build the agent-facing brief, resolving the template if one is set.
    pub fn brief(&self, id: &ProjectId, feedback: Option<String>) -> Result<ProjectBrief, StoreError> {
        let project = self.get(id)?;
        let template = match &project.template_id {
            Some(template_id) => Some(TemplateRepo::new(self.db.clone()).get(template_id)?),
            None => None,
        };
        Ok(ProjectBrief {
            project_id: project.id,
            topic: project.topic,
            tone: project.tone,
            audience: project.target_audience,
            word_range: WordRange {
                min: project.word_count_min,
                max: project.word_count_max,
            },
            language: project.language,
            include_hashtags: project.include_hashtags,
            include_cta: project.include_cta,
            include_emoji: project.include_emoji,
            template_instructions: template.as_ref().map(|t| t.structure_prompt.clone()),
            example_post: template.and_then(|t| t.example_post),
            feedback,
        })
    }
}

fn row_to_project(row: &rusqlite::Row<'_>) -> Result<ProjectRow, StoreError> {
    const T: &str = "projects";
    let status: String = row_helpers::get(row, 12, T, "status")?;
    let score: Option<i64> = row_helpers::get_opt(row, 14, T, "groundedness_score")?;
    Ok(ProjectRow {
        id: ProjectId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        title: row_helpers::get(row, 1, T, "title")?,
        topic: row_helpers::get(row, 2, T, "topic")?,
        tone: row_helpers::get(row, 3, T, "tone")?,
        target_audience: row_helpers::get(row, 4, T, "target_audience")?,
        word_count_min: row_helpers::get_u32(row, 5, T, "word_count_min")?,
        word_count_max: row_helpers::get_u32(row, 6, T, "word_count_max")?,
        language: row_helpers::get(row, 7, T, "language")?,
        include_hashtags: row_helpers::get(row, 8, T, "include_hashtags")?,
        include_cta: row_helpers::get(row, 9, T, "include_cta")?,
        include_emoji: row_helpers::get(row, 10, T, "include_emoji")?,
        template_id: row_helpers::get_opt::<String>(row, 11, T, "template_id")?.map(TemplateId::from_raw),
        status: row_helpers::parse_enum(&status, T, "status")?,
        final_post: row_helpers::get_opt(row, 13, T, "final_post")?,
        groundedness_score: score.map(|s| s.clamp(0, 5) as u8),
        current_report_id: row_helpers::get_opt::<String>(row, 15, T, "current_report_id")?.map(ReportId::from_raw),
        created_at: row_helpers::get(row, 16, T, "created_at")?,
        updated_at: row_helpers::get(row, 17, T, "updated_at")?,
        is_favorite: row_helpers::get(row, 18, T, "is_favorite")?,
        published_at: row_helpers::get_opt(row, 19, T, "published_at")?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::templates::NewTemplate;

    pub(crate) fn new_project(topic: &str) -> NewProject {
        serde_json::from_value(serde_json::json!({ "title": "Test", "topic": topic })).unwrap()
    }

    #[test]
    fn create_applies_defaults() {
        let repo = ProjectRepo::new(Database::in_memory().unwrap());
        let project = repo.create(&new_project("async rust")).unwrap();
        assert!(project.id.as_str().starts_with("proj_"));

        let fetched = repo.get(&project.id).unwrap();
        assert_eq!(fetched.status, ProjectStatus::Draft);
        assert_eq!((fetched.word_count_min, fetched.word_count_max), (150, 300));
        assert_eq!(fetched.language, "English");
        assert!(fetched.include_hashtags && fetched.include_cta && !fetched.include_emoji);
        assert!(fetched.final_post.is_none());
    }

    #[test]
    fn create_with_unknown_template_is_not_found() {
        let repo = ProjectRepo::new(Database::in_memory().unwrap());
        let mut project = new_project("x");
        project.template_id = Some(TemplateId::from_raw("tmpl_nope"));
        assert!(matches!(repo.create(&project), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn validate_rejects_bad_ranges() {
        let mut project = new_project("x");
        project.word_count_min = 400;
        assert!(project.validate().is_err());
        project.word_count_min = 0;
        assert!(project.validate().is_err());
        assert!(new_project("  ").validate().is_err());
        assert!(new_project("ok").validate().is_ok());
    }

    #[test]
    fn status_and_final_post_updates() {
        let repo = ProjectRepo::new(Database::in_memory().unwrap());
        let project = repo.create(&new_project("x")).unwrap();
        repo.set_status(&project.id, ProjectStatus::Writing).unwrap();
        assert_eq!(repo.get(&project.id).unwrap().status, ProjectStatus::Writing);

        repo.set_final_post(&project.id, "final text").unwrap();
        let fetched = repo.get(&project.id).unwrap();
        assert_eq!(fetched.status, ProjectStatus::Approved);
        assert_eq!(fetched.final_post.as_deref(), Some("final text"));
    }

    #[test]
    fn set_status_on_missing_project_fails() {
        let repo = ProjectRepo::new(Database::in_memory().unwrap());
        let err = repo
            .set_status(&ProjectId::from_raw("proj_missing"), ProjectStatus::Failed)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn brief_resolves_template() {
        let db = Database::in_memory().unwrap();
        let template = TemplateRepo::new(db.clone())
            .create(&NewTemplate {
                name: "Story".into(),
                tone: "storytelling".into(),
                structure_prompt: "Start with an anecdote.".into(),
                example_post: Some("Once upon a time...".into()),
            })
            .unwrap();
        let repo = ProjectRepo::new(db);
        let mut project = new_project("leadership");
        project.template_id = Some(template.id);
        let project = repo.create(&project).unwrap();

        let brief = repo.brief(&project.id, Some("shorter please".into())).unwrap();
        assert_eq!(brief.topic, "leadership");
        assert_eq!(brief.template_instructions.as_deref(), Some("Start with an anecdote."));
        assert_eq!(brief.example_post.as_deref(), Some("Once upon a time..."));
        assert_eq!(brief.feedback.as_deref(), Some("shorter please"));
    }

    #[test]
    fn favorite_toggles() {
        let repo = ProjectRepo::new(Database::in_memory().unwrap());
        let project = repo.create(&new_project("x")).unwrap();
        assert!(!project.is_favorite);
        assert!(repo.toggle_favorite(&project.id).unwrap());
        assert!(repo.get(&project.id).unwrap().is_favorite);
        assert!(!repo.toggle_favorite(&project.id).unwrap());
        assert!(matches!(
            repo.toggle_favorite(&ProjectId::from_raw("proj_missing")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn publish_requires_an_approved_post() {
        let repo = ProjectRepo::new(Database::in_memory().unwrap());
        let project = repo.create(&new_project("x")).unwrap();
        assert!(matches!(repo.publish(&project.id), Err(StoreError::Conflict(_))));

        repo.set_final_post(&project.id, "final text").unwrap();
        let published = repo.publish(&project.id).unwrap();
        assert_eq!(published.status, ProjectStatus::Published);
        let stamped = published.published_at.clone().unwrap();

        let again = repo.publish(&project.id).unwrap();
        assert_eq!(again.published_at.as_deref(), Some(stamped.as_str()));
    }

    #[test]
    fn update_post_needs_existing_post() {
        let repo = ProjectRepo::new(Database::in_memory().unwrap());
        let project = repo.create(&new_project("x")).unwrap();
        assert!(matches!(
            repo.update_post(&project.id, "edited"),
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            repo.update_post(&ProjectId::from_raw("proj_missing"), "edited"),
            Err(StoreError::NotFound(_))
        ));

        repo.set_final_post(&project.id, "final text").unwrap();
        let edited = repo.update_post(&project.id, "edited by hand").unwrap();
        assert_eq!(edited.final_post.as_deref(), Some("edited by hand"));
        assert_eq!(edited.status, ProjectStatus::Approved);
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            ProjectStatus::Draft,
            ProjectStatus::Researching,
            ProjectStatus::Writing,
            ProjectStatus::Reviewing,
            ProjectStatus::Approved,
            ProjectStatus::Published,
            ProjectStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ProjectStatus>().unwrap(), status);
        }
    }
}
