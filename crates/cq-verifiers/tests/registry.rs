//! Verifiers built from configuration, driven by the pending manager.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cq_core::fakes::{FakeCheckout, FakeReviewClient, RecordingStatusSink};
use cq_core::{
    ChangeInfo, Context, ManagerConfig, PendingManager, ReviewMessage, TryJobResult, TryJobState,
    VerifyResult,
};
use cq_state::fakes::MemorySnapshotStore;
use cq_verifiers::{build_registry, BuildError, TreeState, TreeStatusSource, VerifierConfig, NO_LGTM};
use serde::Deserialize;

#[derive(Deserialize)]
struct Verifiers {
    verifiers: Vec<VerifierConfig>,
}

const CONFIG: &str = r#"
[[verifiers]]
kind = "project_base"
patterns = ['https://git\.example\.org/project\.git']

[[verifiers]]
kind = "reviewer_lgtm"
committers = ['.*@example\.org']

[[verifiers]]
kind = "command"
name = "presubmit"
command = ["sh", "-c", "test -f README"]
timeout_secs = 30

[[verifiers]]
kind = "tree_status"
url = "https://status.example.org/current"

[[verifiers]]
kind = "try_jobs"
builders = ["linux_rel"]
max_retries = 1
"#;

struct OpenTree;

#[async_trait]
impl TreeStatusSource for OpenTree {
    async fn fetch(&self, _url: &str) -> VerifyResult<TreeState> {
        Ok(TreeState {
            general_state: "open".to_string(),
            message: "Tree is open".to_string(),
        })
    }
}

fn parse() -> Vec<VerifierConfig> {
    toml::from_str::<Verifiers>(CONFIG).unwrap().verifiers
}

fn change(issue: u64, lgtm: bool) -> ChangeInfo {
    let mut messages = Vec::new();
    if lgtm {
        messages.push(ReviewMessage {
            sender: "reviewer@example.org".to_string(),
            text: "lgtm".to_string(),
            approval: false,
        });
    }
    ChangeInfo {
        issue,
        patchset: 1,
        owner: "author@example.org".to_string(),
        reviewers: vec!["reviewer@example.org".to_string()],
        description: "Add README".to_string(),
        base_url: "https://git.example.org/project.git".to_string(),
        relpath: String::new(),
        messages,
        created_at: Utc::now(),
    }
}

#[test]
fn config_parses_with_defaults() {
    let configs = parse();
    let names: Vec<&str> = configs.iter().map(VerifierConfig::name).collect();
    assert_eq!(
        names,
        vec!["project_bases", "reviewer_lgtm", "presubmit", "tree_status", "try_jobs"]
    );
    assert!(matches!(
        configs[4],
        VerifierConfig::TryJobs { max_retries: 1, timeout_secs: 14400, .. }
    ));
}

#[tokio::test]
async fn duplicate_names_are_rejected() {
    let mut configs = parse();
    configs.push(VerifierConfig::TreeStatus {
        url: "https://status.example.org/other".to_string(),
    });
    let context = Context::new(
        Arc::new(FakeReviewClient::new()),
        Arc::new(FakeCheckout::default()),
        Arc::new(RecordingStatusSink::new()),
        false,
    );
    let err = build_registry(&configs, &context, Arc::new(OpenTree)).unwrap_err();
    assert!(matches!(err, BuildError::Registry(_)));
    assert!(err.to_string().contains("tree_status"));
}

#[tokio::test]
async fn configured_pipeline_commits_approved_green_change() {
    let workdir = tempfile::tempdir().unwrap();
    std::fs::write(workdir.path().join("README"), "hello\n").unwrap();

    let review = Arc::new(FakeReviewClient::new());
    review.add_pending(change(1, true), "diff --git a/README b/README\n");
    review.add_pending(change(2, false), "diff --git a/README b/README\n");
    let checkout = Arc::new(FakeCheckout::new(workdir.path()));
    let context = Context::new(
        review.clone(),
        checkout.clone(),
        Arc::new(RecordingStatusSink::new()),
        true,
    );
    let registry = build_registry(&parse(), &context, Arc::new(OpenTree)).unwrap();
    let mut manager = PendingManager::new(
        context,
        registry,
        Arc::new(MemorySnapshotStore::new()),
        ManagerConfig {
            workers: 3,
            round_delay: Duration::from_millis(1),
            max_rounds: None,
        },
    );

    let first = manager.run_round().await.unwrap();
    assert!(first.committed.is_empty());
    assert_eq!(first.failed, vec![2]);
    assert_eq!(review.comments_for(2), vec![NO_LGTM.to_string()]);
    assert_eq!(review.triggered().len(), 2);

    review.set_try_jobs(
        1,
        1,
        vec![TryJobResult {
            builder: "linux_rel".to_string(),
            state: TryJobState::Success,
            url: None,
        }],
    );
    let second = manager.run_round().await.unwrap();

    assert_eq!(second.committed, vec![1]);
    assert_eq!(review.closed(), vec![1]);
    assert_eq!(checkout.commits()[0].author, "author@example.org");
    assert_eq!(manager.queue().len(), 1);
}
