use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use postcrew_core::agents::AgentRole;
use postcrew_core::ids::{RunId, StepId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// One recorded agent invocation within a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRow {
    pub id: StepId,
    pub run_id: RunId,
    pub agent: AgentRole,
    pub step_number: u32,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub decision: String,
    pub duration_ms: u64,
    pub tokens_used: Option<u32>,
    pub created_at: String,
}

#[derive(Clone, Debug)]
pub struct NewStep {
    pub agent: AgentRole,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub decision: String,
    pub duration_ms: u64,
    pub tokens_used: Option<u32>,
}

/// Append-only ledger of agent steps.
pub struct StepRepo {
    db: Database,
}

impl StepRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a step, assigning the next step number for the run (starting at 1).
    #[instrument(skip(self, step), fields(run_id = %run_id, agent = %step.agent))]
    pub fn append(&self, run_id: &RunId, step: NewStep) -> Result<StepRow, StoreError> {
        let id = StepId::new();
        let created_at = Utc::now().to_rfc3339();
        let input = serde_json::to_string(&step.input)?;
        let output = serde_json::to_string(&step.output)?;

        let step_number = self.db.with_tx(|tx| {
            let next: i64 = tx.query_row(
                "SELECT COALESCE(MAX(step_number), 0) + 1 FROM agent_steps WHERE run_id = ?1",
                [run_id.as_str()],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO agent_steps (id, run_id, agent_name, step_number, input, output, decision,
                     duration_ms, tokens_used, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    id.as_str(),
                    run_id.as_str(),
                    step.agent.as_str(),
                    next,
                    input,
                    output,
                    step.decision,
                    step.duration_ms as i64,
                    step.tokens_used,
                    created_at,
                ],
            )?;
            Ok(next as u32)
        })?;

        Ok(StepRow {
            id,
            run_id: run_id.clone(),
            agent: step.agent,
            step_number,
            input: step.input,
            output: step.output,
            decision: step.decision,
            duration_ms: step.duration_ms,
            tokens_used: step.tokens_used,
            created_at,
        })
    }

    /// Steps of a run in step-number order.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn list_for_run(&self, run_id: &RunId) -> Result<Vec<StepRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, agent_name, step_number, input, output, decision, duration_ms,
                        tokens_used, created_at
                 FROM agent_steps WHERE run_id = ?1 ORDER BY step_number ASC",
            )?;
            let mut rows = stmt.query([run_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_step(row)?);
            }
            Ok(out)
        })
    }

    pub fn count_for_run(&self, run_id: &RunId) -> Result<u32, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM agent_steps WHERE run_id = ?1",
                [run_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as u32)
        })
    }
}

fn row_to_step(row: &rusqlite::Row<'_>) -> Result<StepRow, StoreError> {
    const T: &str = "agent_steps";
    let agent: String = row_helpers::get(row, 2, T, "agent_name")?;
    let input: String = row_helpers::get(row, 4, T, "input")?;
    let output: String = row_helpers::get(row, 5, T, "output")?;
    let duration_ms: i64 = row_helpers::get(row, 7, T, "duration_ms")?;
    Ok(StepRow {
        id: StepId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        run_id: RunId::from_raw(row_helpers::get::<String>(row, 1, T, "run_id")?),
        agent: row_helpers::parse_enum(&agent, T, "agent_name")?,
        step_number: row_helpers::get_u32(row, 3, T, "step_number")?,
        input: row_helpers::parse_json(&input, T, "input")?,
        output: row_helpers::parse_json(&output, T, "output")?,
        decision: row_helpers::get(row, 6, T, "decision")?,
        duration_ms: duration_ms.max(0) as u64,
        tokens_used: row_helpers::get_opt(row, 8, T, "tokens_used")?,
        created_at: row_helpers::get(row, 9, T, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projects::tests::new_project;
    use crate::projects::ProjectRepo;
    use crate::runs::RunRepo;
    use serde_json::json;

    fn setup() -> (StepRepo, RunId) {
        let db = Database::in_memory().unwrap();
        let project = ProjectRepo::new(db.clone()).create(&new_project("t")).unwrap();
        let run = RunRepo::new(db.clone()).create_running(&project.id).unwrap();
        (StepRepo::new(db), run.id)
    }

    fn step(agent: AgentRole, decision: &str) -> NewStep {
        NewStep {
            agent,
            input: json!({"kind": "route"}),
            output: json!({"decision": decision}),
            decision: decision.into(),
            duration_ms: 12,
            tokens_used: None,
        }
    }

    #[test]
    fn step_numbers_start_at_one_and_increase() {
        let (repo, run_id) = setup();
        let agents = [AgentRole::Supervisor, AgentRole::Researcher, AgentRole::Supervisor, AgentRole::Writer];
        for agent in agents {
            repo.append(&run_id, step(agent, "go")).unwrap();
        }
        let steps = repo.list_for_run(&run_id).unwrap();
        let numbers: Vec<u32> = steps.iter().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        let order: Vec<AgentRole> = steps.iter().map(|s| s.agent).collect();
        assert_eq!(order, agents.to_vec());
    }

    #[test]
    fn snapshots_roundtrip() {
        let (repo, run_id) = setup();
        let mut new = step(AgentRole::Critic, "revise");
        new.tokens_used = Some(321);
        let appended = repo.append(&run_id, new).unwrap();
        assert_eq!(appended.step_number, 1);

        let fetched = &repo.list_for_run(&run_id).unwrap()[0];
        assert_eq!(fetched.output["decision"], "revise");
        assert_eq!(fetched.tokens_used, Some(321));
        assert_eq!(fetched.duration_ms, 12);
    }

    #[test]
    fn numbering_is_per_run() {
        let db = Database::in_memory().unwrap();
        let projects = ProjectRepo::new(db.clone());
        let runs = RunRepo::new(db.clone());
        let a = runs.create_running(&projects.create(&new_project("a")).unwrap().id).unwrap();
        let b = runs.create_running(&projects.create(&new_project("b")).unwrap().id).unwrap();
        let repo = StepRepo::new(db);

        repo.append(&a.id, step(AgentRole::Supervisor, "x")).unwrap();
        repo.append(&a.id, step(AgentRole::Researcher, "x")).unwrap();
        let first_b = repo.append(&b.id, step(AgentRole::Supervisor, "x")).unwrap();
        assert_eq!(first_b.step_number, 1);
        assert_eq!(repo.count_for_run(&a.id).unwrap(), 2);
    }
}
