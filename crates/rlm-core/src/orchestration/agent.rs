//! The recursive agent: a router-driven loop over one persistent REPL.
//!
//! Each turn the router sees only history metadata and a preview of the last
//! output, then picks one of:
//!
//! - `CODE`: the coder writes code, the REPL runs it on a blocking worker,
//!   the turn is appended to history and the output is checked for a
//!   termination marker
//! - `ANSWER`: the responder answers from the full history, compacted when
//!   oversized, with a history-only fallback when it fails
//! - `DELEGATE`: the delegator splits the task and each subtask runs in a
//!   child agent one level deeper
//!
//! Only budget exhaustion (and a crashed execution worker) ends a run with
//! an error; every other failure becomes text in history.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::Instrument;

use crate::artifacts::{RunContext, REPORT_FILENAME};
use crate::budget::BudgetLedger;
use crate::config::AgentConfig;
use crate::executor::CodeExecutor;
use crate::history::{HistoryEntry, DEFAULT_PREVIEW_CHARS};
use crate::llm::{LanguageModel, LlmError};
use crate::metrics::METRICS;
use crate::obs;
use crate::orchestration::action::Action;
use crate::orchestration::context::{format_full_history, ContextCompactor};
use crate::orchestration::error::{AgentError, AgentResult};
use crate::orchestration::fallback::{
    artifacts_info, enhance_with_artifacts, fallback_answer, DELEGATION_PREFIX,
};
use crate::orchestration::roles::Roles;
use crate::repl::Repl;
use crate::sandbox::SandboxGlobals;
use crate::tools::{ChildSpawner, DelegationTool, SearchProvider, SubQueryTool, Toolbox};

pub const MAX_STEPS_MESSAGE: &str = "Max steps reached without definitive answer.";

/// Called synchronously after every turn is appended to history.
pub type StepObserver = Arc<dyn Fn(&HistoryEntry) + Send + Sync>;

/// Everything a child agent inherits from its parent.
#[derive(Clone)]
struct AgentParts {
    config: Arc<AgentConfig>,
    roles: Roles,
    ledger: Arc<BudgetLedger>,
    sub_query_model: Option<Arc<dyn LanguageModel>>,
    search: Option<Arc<dyn SearchProvider>>,
    run: Option<Arc<RunContext>>,
}

pub struct AgentBuilder {
    parts: AgentParts,
    depth: u32,
    agent_id: Option<String>,
    repl: Option<Repl>,
    observer: Option<StepObserver>,
}

impl AgentBuilder {
    pub fn new(config: AgentConfig, roles: Roles) -> Self {
        let ledger = Arc::new(BudgetLedger::new(config.budget.max_usd));
        Self {
            parts: AgentParts {
                config: Arc::new(config),
                roles,
                ledger,
                sub_query_model: None,
                search: None,
                run: None,
            },
            depth: 0,
            agent_id: None,
            repl: None,
            observer: None,
        }
    }

    /// Shares an existing ledger, e.g. the one the role models record into.
    pub fn ledger(mut self, ledger: Arc<BudgetLedger>) -> Self {
        self.parts.ledger = ledger;
        self
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Model behind `llm_query` and context compaction.
    pub fn sub_query_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.parts.sub_query_model = Some(model);
        self
    }

    pub fn search(mut self, provider: Arc<dyn SearchProvider>) -> Self {
        self.parts.search = Some(provider);
        self
    }

    pub fn run_context(mut self, run: Arc<RunContext>) -> Self {
        self.parts.run = Some(run);
        self
    }

    /// Continues from a stored REPL instead of a fresh namespace.
    pub fn repl(mut self, repl: Repl) -> Self {
        self.repl = Some(repl);
        self
    }

    pub fn observer(mut self, observer: impl Fn(&HistoryEntry) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Validates the config and, when `output_dir` is set and no run context
    /// was given, creates the run directory.
    pub fn build(self) -> AgentResult<Agent> {
        let AgentBuilder {
            mut parts,
            depth,
            agent_id,
            repl,
            observer,
        } = self;
        parts.config.validate()?;
        if parts.run.is_none() {
            if let Some(base) = &parts.config.output_dir {
                parts.run = Some(Arc::new(RunContext::create(base)?));
            }
        }
        let config = Arc::clone(&parts.config);

        let spawner: Arc<dyn ChildSpawner> = Arc::new(AgentSpawner {
            parts: parts.clone(),
        });
        let mut toolbox = Toolbox::new(DelegationTool::new(depth, config.max_depth, Some(spawner)));
        if let Some(search) = &parts.search {
            toolbox = toolbox.with_search(Arc::clone(search));
        }
        if let Some(model) = &parts.sub_query_model {
            toolbox = toolbox.with_sub_query(Arc::new(SubQueryTool::new(
                Arc::clone(model),
                config.max_chunk_chars,
            )));
        }

        let mut executor = CodeExecutor::new(config.execution.limits()).with_host(Arc::new(toolbox));
        if let Some(run) = &parts.run {
            executor = executor.with_run_context(Arc::clone(run), config.context_dir.clone());
        }

        let repl = match repl {
            Some(mut repl) => {
                repl.set_executor(executor);
                repl
            }
            None => {
                let mut globals = SandboxGlobals::builder().depth(depth).with_tools();
                if let Some(run) = &parts.run {
                    globals = globals.output_dir(run.working_dir());
                }
                if let Some(dir) = &config.context_dir {
                    globals = globals.context_dir(dir.clone());
                }
                Repl::new(globals.build(), executor)
            }
        };

        let mut compactor = ContextCompactor::new(config.compaction.clone());
        if let Some(model) = &parts.sub_query_model {
            compactor = compactor.with_model(Arc::clone(model));
        }
        if let Some(run) = &parts.run {
            compactor = compactor.with_run_context(Arc::clone(run));
        }

        let id = agent_id.unwrap_or_else(new_agent_id);
        tracing::debug!(agent_id = %id, depth, "agent built");
        Ok(Agent {
            id,
            depth,
            parts,
            repl,
            compactor,
            observer,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Answered,
    Final,
    MaxSteps,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Answered => "answered",
            Outcome::Final => "final",
            Outcome::MaxSteps => "max_steps",
        }
    }
}

pub struct Agent {
    id: String,
    depth: u32,
    parts: AgentParts,
    repl: Repl,
    compactor: ContextCompactor,
    observer: Option<StepObserver>,
}

impl Agent {
    pub fn builder(config: AgentConfig, roles: Roles) -> AgentBuilder {
        AgentBuilder::new(config, roles)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn repl(&self) -> &Repl {
        &self.repl
    }

    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.parts.ledger
    }

    pub fn run_context(&self) -> Option<&Arc<RunContext>> {
        self.parts.run.as_ref()
    }

    /// Hands the REPL back, e.g. to keep it in a
    /// [`ReplStateStore`](crate::repl::ReplStateStore) for follow-ups.
    pub fn into_repl(self) -> Repl {
        self.repl
    }

    /// Runs the loop until an answer, a termination marker or the step
    /// limit.
    pub async fn run(&mut self, task: &str) -> AgentResult<String> {
        let started = Instant::now();
        let span = obs::agent_span(&self.id, self.depth);
        let result = self.run_loop(task).instrument(span.clone()).await;

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let steps = u32::try_from(self.repl.history().len()).unwrap_or(u32::MAX);
        let outcome = match &result {
            Ok((_, outcome)) => outcome.as_str(),
            Err(e) if e.is_budget() => "budget_exceeded",
            Err(_) => "error",
        };
        span.in_scope(|| {
            obs::emit_agent_finished(&self.id, steps, elapsed_ms, outcome);
            tracing::debug!(cost_usd = self.parts.ledger.current_cost(), "ledger after run");
        });
        result.map(|(answer, _)| answer)
    }

    async fn run_loop(&mut self, task: &str) -> AgentResult<(String, Outcome)> {
        obs::emit_agent_started(&self.id, self.depth, task);
        self.repl.set_task(task);
        let config = Arc::clone(&self.parts.config);
        let mut delegate_rounds = 0;

        for turn in 1..=config.max_steps {
            let context = self.compact_context();
            let router = Arc::clone(&self.parts.roles.router);
            let decided = match router.decide(task, &context).await {
                Ok(action) => action,
                Err(LlmError::Budget(exceeded)) => return Err(exceeded.into()),
                Err(e) => {
                    tracing::warn!(error = %e, "router failed; answering");
                    Action::Answer
                }
            };
            let action = self.constrain(decided, delegate_rounds);
            obs::emit_step_decided(&self.id, turn, action.as_str());

            match action {
                Action::Answer => {
                    let answer = self.answer(task).await?;
                    self.finish_report(&answer);
                    return Ok((answer, Outcome::Answered));
                }
                Action::Code => {
                    if let Some(answer) = self.code_turn(task, &context).await? {
                        self.finish_report(&answer);
                        return Ok((answer, Outcome::Final));
                    }
                }
                Action::Delegate => {
                    delegate_rounds += 1;
                    self.delegate_turn(task, &context).await?;
                }
            }
        }

        tracing::warn!(max_steps = config.max_steps, "step limit reached");
        Ok((MAX_STEPS_MESSAGE.to_string(), Outcome::MaxSteps))
    }

    /// History metadata plus a preview of the last output.
    fn compact_context(&self) -> String {
        let metadata = self.repl.metadata_summary();
        let preview = self.repl.last_output_preview(DEFAULT_PREVIEW_CHARS);
        if preview.is_empty() {
            metadata
        } else {
            format!("{metadata}\n\n{preview}")
        }
    }

    /// Delegation is refused once the round limit or the depth limit is hit.
    fn constrain(&self, action: Action, delegate_rounds: u32) -> Action {
        if action != Action::Delegate {
            return action;
        }
        let config = &self.parts.config;
        if delegate_rounds >= config.max_delegate_rounds || self.depth >= config.max_depth {
            tracing::info!(
                delegate_rounds,
                depth = self.depth,
                "delegation limit reached; answering"
            );
            return Action::Answer;
        }
        action
    }

    async fn answer(&mut self, task: &str) -> AgentResult<String> {
        let full = format_full_history(self.repl.history());
        let (images, info) = match &self.parts.run {
            Some(run) => (run.list_images(), artifacts_info(&run.artifacts())),
            None => (Vec::new(), String::new()),
        };

        if self.compactor.should_compact(&full) {
            let answer = self.compactor.compact(task, &full, &info).await?;
            return Ok(enhance_with_artifacts(&answer, &images));
        }

        let responder = Arc::clone(&self.parts.roles.responder);
        match responder.respond(task, &full, &info).await {
            Ok(text) if !text.trim().is_empty() => Ok(enhance_with_artifacts(&text, &images)),
            Ok(_) => {
                tracing::warn!("responder returned nothing; using fallback");
                Ok(fallback_answer(self.repl.history(), &images))
            }
            Err(LlmError::Budget(exceeded)) => Err(exceeded.into()),
            Err(e) => {
                tracing::error!(error = %e, "responder failed; using fallback");
                Ok(fallback_answer(self.repl.history(), &images))
            }
        }
    }

    /// One CODE turn. Returns the answer when the output carries a
    /// termination marker.
    async fn code_turn(&mut self, task: &str, context: &str) -> AgentResult<Option<String>> {
        let coder = Arc::clone(&self.parts.roles.coder);
        let code = match coder.generate(task, context).await {
            Ok(code) => code,
            Err(LlmError::Budget(exceeded)) => return Err(exceeded.into()),
            Err(e) => {
                tracing::error!(error = %e, "coder failed");
                let output = format!("Error during coding/execution: {e}");
                self.record("Attempted Code Generation", &output);
                return Ok(None);
            }
        };

        let execution = self.repl.execute(&code).await?;
        let step = self.repl.next_step();
        obs::emit_code_executed(
            &self.id,
            step,
            execution.outcome.as_str(),
            execution.output.chars().count(),
        );
        for artifact in &execution.new_artifacts {
            tracing::info!(filename = %artifact.filename, kind = %artifact.kind, "artifact detected");
        }
        self.record(&execution.code, &execution.output);

        let answer = self.repl.check_for_final(&execution.output);
        if let Some(answer) = &answer {
            obs::emit_final_detected(&self.id, step, answer.chars().count());
        }
        Ok(answer)
    }

    /// One DELEGATE turn: subtasks run concurrently in child agents and
    /// their answers are recorded as a single history entry.
    async fn delegate_turn(&mut self, task: &str, context: &str) -> AgentResult<()> {
        let delegator = Arc::clone(&self.parts.roles.delegator);
        let subtasks = match delegator.decompose(task, context).await {
            Ok(subtasks) => subtasks,
            Err(LlmError::Budget(exceeded)) => return Err(exceeded.into()),
            Err(e) => {
                tracing::warn!(error = %e, "delegator failed");
                Vec::new()
            }
        };

        if subtasks.is_empty() {
            self.record(&format!("{DELEGATION_PREFIX} 0 subtasks"), "No subtasks produced.");
            return Ok(());
        }

        let spawner = AgentSpawner {
            parts: self.parts.clone(),
        };
        let child_depth = self.depth + 1;
        tracing::info!(subtasks = subtasks.len(), child_depth, "delegating subtasks");
        let runs = subtasks.iter().map(|subtask| {
            METRICS.inc_delegations();
            spawner.spawn(subtask.clone(), child_depth)
        });
        let results = futures::future::join_all(runs).await;

        let mut sections = Vec::with_capacity(subtasks.len());
        for (i, (subtask, result)) in subtasks.iter().zip(results).enumerate() {
            let answer = match result {
                Ok(answer) => answer,
                Err(e) if e.is_budget() => return Err(e),
                Err(e) => format!("[Delegation failed: {e}]"),
            };
            sections.push(format!("Subtask {}: {subtask}\nResult: {answer}", i + 1));
        }
        let code = format!("{DELEGATION_PREFIX} {} subtasks", subtasks.len());
        self.record(&code, &sections.join("\n\n"));
        Ok(())
    }

    fn record(&mut self, code: &str, output: &str) {
        let entry = self.repl.record_turn(code, output);
        if let Some(observer) = &self.observer {
            observer(entry);
        }
    }

    /// Root agents append the answer to the run report and save it.
    fn finish_report(&self, answer: &str) {
        if self.depth > 0 {
            return;
        }
        let Some(run) = &self.parts.run else {
            return;
        };
        run.add_to_report(answer);
        match run.save_report(REPORT_FILENAME) {
            Ok(path) => tracing::info!(path = %path.display(), "saved final report"),
            Err(e) => tracing::error!(error = %e, "failed to save final report"),
        }
    }
}

/// Builds children with the parent's roles, ledger, tools and run directory
/// and a fresh namespace.
struct AgentSpawner {
    parts: AgentParts,
}

#[async_trait]
impl ChildSpawner for AgentSpawner {
    async fn spawn(&self, task: String, depth: u32) -> Result<String, AgentError> {
        let builder = AgentBuilder {
            parts: self.parts.clone(),
            depth,
            agent_id: None,
            repl: None,
            observer: None,
        };
        let mut child = builder.build()?;
        child.run(&task).await
    }
}

fn new_agent_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("agent-{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{scripted_roles, ScriptedModel};

    fn config() -> AgentConfig {
        AgentConfig {
            max_steps: 4,
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn test_answer_without_code() {
        let roles = scripted_roles(["ANSWER"], ["unused"], ["Paris"], ["- unused"]);
        let mut agent = Agent::builder(config(), roles).build().unwrap();
        assert_eq!(agent.run("Capital of France?").await.unwrap(), "Paris");
        assert!(agent.repl().history().is_empty());
    }

    #[tokio::test]
    async fn test_code_then_final_marker() {
        let roles = scripted_roles(
            ["CODE", "CODE"],
            ["print(2+2)", "print(FINAL(\"4\"))"],
            ["unused"],
            ["- unused"],
        );
        let mut agent = Agent::builder(config(), roles).build().unwrap();
        assert_eq!(agent.run("What is 2+2?").await.unwrap(), "4");
        assert_eq!(agent.repl().history().len(), 2);
        assert_eq!(agent.repl().history().entries()[0].output, "4");
    }

    #[tokio::test]
    async fn test_responder_failure_uses_fallback() {
        let mut roles = scripted_roles(["CODE", "ANSWER"], ["print('partial')"], ["x"], ["- x"]);
        roles.responder = Arc::new(crate::orchestration::roles::ModelResponder::new(Arc::new(
            crate::fakes::FailingModel::new("down"),
        )));
        let mut agent = Agent::builder(config(), roles).build().unwrap();
        let answer = agent.run("t").await.unwrap();
        assert!(answer.starts_with("Task completed after 1 steps with 1 code executions."));
        assert!(answer.ends_with("Recent outputs:\npartial"));
    }

    #[tokio::test]
    async fn test_router_failure_means_answer() {
        let mut roles = scripted_roles(["CODE"], ["print(1)"], ["direct"], ["- x"]);
        roles.router = Arc::new(crate::orchestration::roles::ModelRouter::new(Arc::new(
            crate::fakes::FailingModel::new("router down"),
        )));
        let mut agent = Agent::builder(config(), roles).build().unwrap();
        assert_eq!(agent.run("t").await.unwrap(), "direct");
    }

    #[tokio::test]
    async fn test_observer_sees_each_turn() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let roles = scripted_roles(["CODE", "CODE", "ANSWER"], ["a = 1", "print(a)"], ["done"], ["- x"]);
        let mut agent = Agent::builder(config(), roles)
            .observer(move |entry| sink.lock().push(entry.step))
            .build()
            .unwrap();
        agent.run("t").await.unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_delegation_rounds_are_bounded() {
        let roles = scripted_roles(["DELEGATE"], ["unused"], ["combined"], ["- part a\n- part b"]);
        let config = AgentConfig {
            max_delegate_rounds: 1,
            max_depth: 1,
            ..config()
        };
        let mut agent = Agent::builder(config, roles).build().unwrap();
        // Children sit at max depth, so they answer directly.
        assert_eq!(agent.run("big task").await.unwrap(), "combined");
        let history = agent.repl().history();
        assert_eq!(history.len(), 1);
        assert_eq!(history.entries()[0].code, "DELEGATE: 2 subtasks");
        assert!(history.entries()[0]
            .output
            .starts_with("Subtask 1: part a\nResult: combined"));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_aborts() {
        let ledger = Arc::new(BudgetLedger::new(0.000_001));
        ledger.add_usage(1_000_000, 0, None);
        let model: Arc<dyn LanguageModel> = Arc::new(crate::llm::BudgetedModel::new(
            Arc::new(ScriptedModel::new(["CODE"])),
            Arc::clone(&ledger),
        ));
        let roles = Roles::single_model(model, 5);
        let mut agent = Agent::builder(config(), roles).ledger(ledger).build().unwrap();
        let err = agent.run("t").await.unwrap_err();
        assert!(err.is_budget());
    }

    #[tokio::test]
    async fn test_root_agent_saves_report() {
        let base = tempfile::tempdir().unwrap();
        let run = Arc::new(RunContext::with_id(base.path(), "report").unwrap());
        let roles = scripted_roles(["ANSWER"], ["unused"], ["The answer."], ["- x"]);
        let mut agent = Agent::builder(config(), roles)
            .run_context(Arc::clone(&run))
            .build()
            .unwrap();
        agent.run("t").await.unwrap();
        let report = std::fs::read_to_string(run.working_dir().join(REPORT_FILENAME)).unwrap();
        assert_eq!(report, "The answer.");
    }
}
