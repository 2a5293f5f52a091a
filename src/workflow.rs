//! Workflow execution: a node graph compiled into sequential fiche runs.
//!
//! Each fiche node gets its own thread and course (one course per node);
//! a node's output feeds the next node's thread as its input message.
//! Trigger nodes are entry markers; tool nodes run a registry tool inline
//! and pass its result along.

use std::sync::Arc;

use uuid::Uuid;

use crate::concierge::ConciergeService;
use crate::context::ExecutionContext;
use crate::db::Database;
use crate::error::{ConciergeError, ErrorKind};
use crate::models::{
    CourseStatus, CourseTrigger, NewThreadMessage, ThreadKind, Workflow, WorkflowNode,
};
use crate::tools::{ToolRegistry, envelope_error};

/// Result of executing one workflow: the courses created, in node order.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub course_ids: Vec<i64>,
    pub final_output: Option<String>,
}

pub struct WorkflowExecutor {
    db: Arc<dyn Database>,
    concierge: Arc<ConciergeService>,
    tools: Arc<ToolRegistry>,
}

impl WorkflowExecutor {
    pub fn new(
        db: Arc<dyn Database>,
        concierge: Arc<ConciergeService>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            db,
            concierge,
            tools,
        }
    }

    pub async fn execute(
        &self,
        workflow: &Workflow,
        input: Option<String>,
    ) -> Result<WorkflowRun, ConciergeError> {
        let mut carry = input;
        let mut course_ids = Vec::new();

        for node in &workflow.nodes {
            match node {
                WorkflowNode::Trigger { name } => {
                    tracing::debug!(workflow_id = workflow.id, trigger = %name, "workflow entry");
                }
                WorkflowNode::Tool { name, args } => {
                    carry = Some(self.run_tool_node(workflow.owner_id, name, args, &carry).await);
                }
                WorkflowNode::Fiche { fiche_id } => {
                    let course_id = self
                        .run_fiche_node(workflow, *fiche_id, carry.take())
                        .await?;
                    course_ids.push(course_id);
                    carry = self
                        .db
                        .get_course(course_id)
                        .await?
                        .and_then(|c| c.summary);
                }
            }
        }

        Ok(WorkflowRun {
            course_ids,
            final_output: carry,
        })
    }

    async fn run_tool_node(
        &self,
        owner_id: i64,
        name: &str,
        args: &serde_json::Value,
        carry: &Option<String>,
    ) -> String {
        let Some(tool) = self.tools.get(name) else {
            return envelope_error(
                ErrorKind::NotFound,
                &format!("unknown tool: {name}"),
                serde_json::Value::Null,
            )
            .to_string();
        };

        // The previous node's output rides along under a fixed key.
        let mut args = args.clone();
        if let (Some(map), Some(input)) = (args.as_object_mut(), carry) {
            map.insert("input".to_string(), serde_json::json!(input));
        }

        let ctx = ExecutionContext::new(Arc::clone(&self.db), owner_id);
        match tool.execute(args, &ctx).await {
            Ok(output) => match output.result {
                serde_json::Value::String(text) => text,
                other => other.to_string(),
            },
            Err(e) => e.to_envelope().to_string(),
        }
    }

    async fn run_fiche_node(
        &self,
        workflow: &Workflow,
        fiche_id: i64,
        input: Option<String>,
    ) -> Result<i64, ConciergeError> {
        let fiche = self
            .db
            .get_fiche(fiche_id)
            .await?
            .ok_or_else(|| ConciergeError::Run(format!("workflow fiche {fiche_id} missing")))?;

        let thread = self
            .db
            .create_thread(fiche.id, workflow.owner_id, &workflow.name, ThreadKind::Workflow)
            .await?;
        self.db
            .append_message(&NewThreadMessage::user(
                thread.id,
                input.unwrap_or_else(|| "Workflow start".to_string()),
            ))
            .await?;
        let course = self
            .db
            .create_course(
                fiche.id,
                thread.id,
                CourseTrigger::Manual,
                CourseStatus::Queued,
                Uuid::new_v4(),
            )
            .await?;

        // Sequential by design: the next node needs this one's output.
        Arc::clone(&self.concierge).execute_course(course.clone()).await;
        Ok(course.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointer;
    use crate::credentials::StaticCredentials;
    use crate::db::MemoryDatabase;
    use crate::events::{CourseEventLog, EventBus};
    use crate::fiche::FicheRunner;
    use crate::llm::{ScriptedLlm, ScriptedTurn};
    use crate::models::{NewFiche, UserRole};
    use crate::queue::JobQueue;
    use crate::tools::builtin::EchoTool;

    #[tokio::test]
    async fn workflow_chains_node_outputs() {
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        let user = db.create_user("o@x.y", None, UserRole::User).await.unwrap();
        let fiche_a = db
            .create_fiche(&NewFiche::basic(user.id, "summarize", "gpt"))
            .await
            .unwrap();
        let fiche_b = db
            .create_fiche(&NewFiche::basic(user.id, "format", "gpt"))
            .await
            .unwrap();

        let workflow = db
            .create_workflow(
                user.id,
                "daily",
                &[
                    WorkflowNode::Trigger {
                        name: "cron".to_string(),
                    },
                    WorkflowNode::Fiche { fiche_id: fiche_a.id },
                    WorkflowNode::Fiche { fiche_id: fiche_b.id },
                ],
            )
            .await
            .unwrap();

        let bus = Arc::new(EventBus::new());
        let log = Arc::new(CourseEventLog::new(Arc::clone(&db), bus));
        let registry = Arc::new(ToolRegistry::builder().register(Arc::new(EchoTool)).build());
        let runner = Arc::new(FicheRunner::new(
            Arc::clone(&registry),
            Arc::new(ScriptedLlm::new(vec![
                ScriptedTurn::Text("node A output".to_string()),
                ScriptedTurn::Text("node B output".to_string()),
            ])),
            Arc::new(MemoryCheckpointer::new()),
        ));
        let concierge = Arc::new(
            ConciergeService::new(
                Arc::clone(&db),
                log,
                runner,
                Arc::new(JobQueue::new(Arc::clone(&db))),
                "gpt",
            )
            .with_credentials(Arc::new(StaticCredentials::new())),
        );

        let executor = WorkflowExecutor::new(Arc::clone(&db), concierge, registry);
        let run = executor.execute(&workflow, None).await.unwrap();

        assert_eq!(run.course_ids.len(), 2);
        assert_eq!(run.final_output.as_deref(), Some("node B output"));

        // Node B's thread received node A's output as input.
        let course_b = db.get_course(run.course_ids[1]).await.unwrap().unwrap();
        let messages = db.list_messages(course_b.thread_id).await.unwrap();
        assert_eq!(messages[0].content, "node A output");

        // One course per node, both terminal.
        for id in &run.course_ids {
            let course = db.get_course(*id).await.unwrap().unwrap();
            assert_eq!(course.status, CourseStatus::Success);
        }
    }
}
