//! End-to-end runs of the agent loop against scripted models.

use std::sync::Arc;

use rlm_core::artifacts::REPORT_FILENAME;
use rlm_core::fakes::scripted_roles;
use rlm_core::{Agent, AgentConfig, ArtifactKind, ReplStateStore, RunContext, MAX_STEPS_MESSAGE};

fn config(max_steps: u32) -> AgentConfig {
    AgentConfig {
        max_steps,
        ..AgentConfig::default()
    }
}

#[tokio::test]
async fn test_two_plus_two_terminates_with_final() {
    let roles = scripted_roles(
        ["CODE", "CODE"],
        ["print(2+2)", "print(FINAL(\"4\"))"],
        ["unused"],
        ["- unused"],
    );
    let mut agent = Agent::builder(config(5), roles).build().unwrap();
    assert_eq!(agent.run("What is 2+2?").await.unwrap(), "4");
}

#[tokio::test]
async fn test_loop_stops_at_step_limit() {
    let roles = scripted_roles(["CODE"], ["x = 1"], ["unused"], ["- unused"]);
    let mut agent = Agent::builder(config(3), roles).build().unwrap();
    assert_eq!(agent.run("never ends").await.unwrap(), MAX_STEPS_MESSAGE);
    assert_eq!(agent.repl().history().len(), 3);
}

#[tokio::test]
async fn test_follow_up_reuses_stored_repl() {
    let store = ReplStateStore::new();

    let first = scripted_roles(["CODE", "ANSWER"], ["total = 40"], ["stored"], ["- unused"]);
    let mut agent = Agent::builder(config(5), first).build().unwrap();
    assert_eq!(agent.run("Remember 40").await.unwrap(), "stored");
    store.store("session", agent.into_repl());

    let second = scripted_roles(
        ["CODE"],
        ["print(FINAL_VAR('total'))"],
        ["unused"],
        ["- unused"],
    );
    let repl = store.take("session").unwrap();
    let mut agent = Agent::builder(config(5), second).repl(repl).build().unwrap();
    assert_eq!(agent.run("What did I store?").await.unwrap(), "40");
    assert!(agent.repl().history().len() >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recursive_llm_from_sandbox_code() {
    // Parent and child share the scripts: the parent routes CODE, the child
    // routes ANSWER and replies through the responder.
    let roles = scripted_roles(
        ["CODE", "ANSWER"],
        ["answer = recursive_llm('sub task', 'ctx')\nprint(FINAL_VAR('answer'))"],
        ["child says hi"],
        ["- unused"],
    );
    let mut agent = Agent::builder(config(5), roles).build().unwrap();
    assert_eq!(agent.run("ask a child").await.unwrap(), "child says hi");
}

#[tokio::test]
async fn test_artifacts_and_report_land_in_run_directory() {
    let base = tempfile::tempdir().unwrap();
    let run = Arc::new(RunContext::with_id(base.path(), "e2e").unwrap());
    let roles = scripted_roles(
        ["CODE", "ANSWER"],
        ["with open('results.csv', 'w') as f:\n    f.write('a,b\\n1,2\\n')\nprint('saved')"],
        ["Results are in results.csv."],
        ["- unused"],
    );
    let mut agent = Agent::builder(config(5), roles)
        .run_context(Arc::clone(&run))
        .build()
        .unwrap();

    let answer = agent.run("Write a table").await.unwrap();
    assert!(answer.starts_with("Results are in results.csv."));

    let artifacts = run.artifacts();
    let csv = artifacts.iter().find(|a| a.filename == "results.csv").unwrap();
    assert_eq!(csv.kind, ArtifactKind::Data);
    let report = std::fs::read_to_string(run.working_dir().join(REPORT_FILENAME)).unwrap();
    assert_eq!(report, answer);
}
