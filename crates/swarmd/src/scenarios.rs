//! End-to-end pipeline scenarios driven through the real orchestrator
//! against real git repositories, with only the gateway mocked.

use std::fs;
use std::thread;
use std::time::Duration;

use swarm_core::state::{
    EscalationSeverity, ReviewCycleStatus, RunStatus, StepStatus, WorkerStatus,
};
use swarm_core::types::TaskId;
use swarm_gateway::types::{
    FixCompletePayload, ReviewDecision, ReviewFinding, ReviewResultPayload, WebhookStatus,
    WorkerCompletePayload,
};
use swarm_git::{branch_has_commits_beyond, current_branch, discover_repo, GitCli};

use crate::ledger::ListFilter;
use crate::orchestrator::Orchestrator;
use crate::retry::RetryStatus;
use crate::testing::{commit_all, run_git, setup, setup_with};

const LINEAR_DOC: &str = "\
## Phase 1
- [ ] Write parser @id(p) @role(builder)
- [ ] Write tests @id(t) @depends(p) @role(builder)
- [ ] Review @id(r) @depends(t) @role(reviewer)
";

#[test]
fn s1_linear_three_step_pipeline_all_pass() {
    let env = setup("s1", LINEAR_DOC);
    let run = env.orch.start_project_run(&env.project).expect("start run");
    let run_id = run.run_id.clone();

    // Only the root of the dependency chain spawns first.
    assert_eq!(env.gateway.spawn_count(), 1);

    for (task, file) in [("p", "parser.rs"), ("t", "tests.rs"), ("r", "review.md")] {
        env.commit_in_worktree(&run_id, task, file, "content\n");
        env.complete_worker(&run_id, 1, task);
    }

    // All three workers done: the review chain is running.
    env.approve_reviews(&run_id, 1);

    let finished = env.orch.runs.get(&run_id).expect("get run").expect("run");
    assert_eq!(finished.status, RunStatus::Completed);

    // Task registry shows three completed entries.
    for task in ["p", "t", "r"] {
        let entry = env
            .orch
            .registry
            .get(&env.project, &TaskId::new(task))
            .expect("registry")
            .expect("entry");
        assert_eq!(entry.status, WorkerStatus::Completed, "task {task}");
    }

    // Ledger carries task_started / task_completed for each worker.
    let items = env
        .orch
        .ledger
        .list(&ListFilter::default())
        .expect("ledger list");
    assert_eq!(items.len(), 3);
    for item in &items {
        let messages: Vec<&str> = item.events.iter().map(|e| e.message.as_str()).collect();
        assert!(messages.contains(&"task_started"), "item {}", item.id);
        assert!(messages.contains(&"task_completed"), "item {}", item.id);
    }

    // No escalations, and every branch landed on main.
    assert!(env.orch.escalations.list_open().expect("open").is_empty());
    let repo_dir = env.repo_dir();
    for file in ["parser.rs", "tests.rs", "review.md"] {
        assert!(repo_dir.join(file).exists(), "missing {file} on main");
    }
    let log = std::process::Command::new("git")
        .args(["log", "--oneline", "main"])
        .current_dir(&repo_dir)
        .output()
        .expect("git log");
    let log = String::from_utf8_lossy(&log.stdout).into_owned();
    assert!(
        log.contains(&format!("Merge phase 1 (run: {run_id}) - Approved by AI review")),
        "merge commit message missing from:\n{log}"
    );

    let _ = fs::remove_dir_all(&env.root);
}

#[test]
fn s2_spawn_failure_then_successful_retry() {
    let env = setup("s2", "- [ ] Ship it @id(ship) @role(builder)\n");
    env.gateway.fail_spawns_matching("/ship", 1);

    let run = env.orch.start_project_run(&env.project).expect("start run");
    let run_id = run.run_id.clone();

    // First spawn failed; a retry timer is pending.
    assert_eq!(env.gateway.spawn_count(), 0);
    assert_eq!(env.orch.timers.pending_count(), 1);

    // The controller-computed delay elapses; the tick fires the retry.
    thread::sleep(Duration::from_millis(80));
    env.orch.tick().expect("tick");
    assert_eq!(env.gateway.spawn_count(), 1);

    let order = swarm_core::types::step_order(1, &TaskId::new("ship"));
    let state = env
        .orch
        .retries
        .get(&run_id, order)
        .expect("retry read")
        .expect("retry state");
    assert_eq!(state.status, RetryStatus::Succeeded);
    assert_eq!(state.attempts.len(), 2);
    assert!(!state.attempts[0].success);
    assert!(state.attempts[1].success);

    // Exactly one spawn event was recorded, for the successful attempt.
    let activity = fs::read_to_string(env.project_dir().join("activity.jsonl"))
        .expect("activity feed");
    let spawn_events = activity
        .lines()
        .filter(|line| line.contains("\"kind\":\"spawn\""))
        .count();
    assert_eq!(spawn_events, 1);

    // The worker finishing (without commits) short-circuits the phase.
    env.complete_worker(&run_id, 1, "ship");
    let finished = env.orch.runs.get(&run_id).expect("get").expect("run");
    assert_eq!(finished.status, RunStatus::Completed);
    assert!(env.orch.escalations.list_open().expect("open").is_empty());

    let _ = fs::remove_dir_all(&env.root);
}

#[test]
fn s3_exhausted_retry_skips_step_and_escalates() {
    let doc = "\
## Phase 1
- [ ] Step one @id(one) @role(builder)
- [ ] Step two @id(two) @role(builder)
- [ ] Step three @id(three) @role(builder)
";
    let env = setup("s3", doc);
    env.gateway.fail_spawns_matching("/two", 3);

    let run = env.orch.start_project_run(&env.project).expect("start run");
    let run_id = run.run_id.clone();

    // one and three spawned; two burned its first attempt.
    assert_eq!(env.gateway.spawn_count(), 2);

    env.commit_in_worktree(&run_id, "one", "one.rs", "one\n");
    env.complete_worker(&run_id, 1, "one"); // re-dispatch burns attempt 2
    env.commit_in_worktree(&run_id, "three", "three.rs", "three\n");
    env.complete_worker(&run_id, 1, "three"); // attempt 3 -> exhausted

    let open = env.orch.escalations.list_open().expect("open");
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].severity, EscalationSeverity::High);
    assert_eq!(open[0].task_id, Some(TaskId::new("two")));

    // The pipeline moved on without step two: review chain is live.
    env.approve_reviews(&run_id, 1);

    let finished = env.orch.runs.get(&run_id).expect("get").expect("run");
    assert_eq!(finished.status, RunStatus::Completed);

    let skipped = finished
        .step_results
        .iter()
        .find(|result| result.step_id == "two")
        .expect("step result for two");
    assert_eq!(skipped.status, StepStatus::Skipped);
    assert!(skipped.escalation_id.is_some());

    let completed: Vec<&str> = finished
        .step_results
        .iter()
        .filter(|r| r.status == StepStatus::Completed)
        .map(|r| r.step_id.as_str())
        .collect();
    assert!(completed.contains(&"one"));
    assert!(completed.contains(&"three"));

    // Steps one and three made it to main; two is absent.
    assert!(env.repo_dir().join("one.rs").exists());
    assert!(env.repo_dir().join("three.rs").exists());
    assert!(!env.repo_dir().join("two.rs").exists());

    // A human later lands step two and its webhook auto-closes the open
    // escalation.
    env.orch
        .handle_task_complete(&swarm_gateway::types::TaskCompletePayload {
            task_id: TaskId::new("two"),
            run_id: None,
            phase_number: None,
            project: Some(env.project.0.clone()),
        })
        .expect("task-complete webhook");
    assert!(env.orch.escalations.list_open().expect("open").is_empty());

    let _ = fs::remove_dir_all(&env.root);
}

#[test]
fn s4_reviewer_requests_changes_then_approves_after_fix() {
    let env = setup_with(
        "s4",
        "- [ ] Build feature @id(feat) @role(builder)\n",
        |config| {
            config.dispatch.review_chain = vec!["reviewer".to_string()];
        },
    );
    let run = env.orch.start_project_run(&env.project).expect("start run");
    let run_id = run.run_id.clone();

    env.commit_in_worktree(&run_id, "feat", "feature.rs", "fn feature() {}\n");
    env.complete_worker(&run_id, 1, "feat");

    let cycle = env
        .orch
        .reviews
        .get(&run_id, 1)
        .expect("review read")
        .expect("cycle");
    assert_eq!(cycle.status, ReviewCycleStatus::Pending);

    // The reviewer rejects with two findings; a fixer is dispatched.
    env.orch
        .handle_review_result(&ReviewResultPayload {
            status: ReviewDecision::RequestChanges,
            run_id: run_id.0.clone(),
            phase_number: 1,
            findings: vec![
                ReviewFinding {
                    severity: "high".to_string(),
                    file: "feature.rs".to_string(),
                    line: Some(1),
                    description: "feature does nothing".to_string(),
                    fix: None,
                },
                ReviewFinding {
                    severity: "low".to_string(),
                    file: "feature.rs".to_string(),
                    line: None,
                    description: "no tests".to_string(),
                    fix: None,
                },
            ],
            summary: Some("needs work".to_string()),
        })
        .expect("review webhook");

    let fixing = env.orch.reviews.get(&run_id, 1).expect("read").expect("cycle");
    assert_eq!(fixing.status, ReviewCycleStatus::Fixing);
    assert!(env
        .gateway
        .spawn_labels()
        .iter()
        .any(|label| label.ends_with("/fixer")));

    // The fixer reports done; re-review is requested from the same role.
    env.orch
        .handle_fix_complete(&FixCompletePayload {
            issues_fixed: 2,
            run_id: Some(run_id.0.clone()),
            phase_number: Some(1),
        })
        .expect("fix webhook");
    let pending_again = env.orch.reviews.get(&run_id, 1).expect("read").expect("cycle");
    assert_eq!(pending_again.status, ReviewCycleStatus::Pending);

    // Approval now merges the phase.
    env.approve_reviews(&run_id, 1);
    let merged = env.orch.reviews.get(&run_id, 1).expect("read").expect("cycle");
    assert_eq!(merged.status, ReviewCycleStatus::Merged);
    assert_eq!(merged.fix_count, 1);

    let finished = env.orch.runs.get(&run_id).expect("get").expect("run");
    assert_eq!(finished.status, RunStatus::Completed);

    let _ = fs::remove_dir_all(&env.root);
}

#[test]
fn s5_merge_conflict_routes_through_resolver_and_resumes() {
    let doc = "\
- [ ] Alpha @id(alpha) @role(builder)
- [ ] Beta @id(beta) @role(builder)
- [ ] Gamma @id(gamma) @role(builder)
";
    let env = setup("s5", doc);
    let run = env.orch.start_project_run(&env.project).expect("start run");
    let run_id = run.run_id.clone();
    assert_eq!(env.gateway.spawn_count(), 3);

    // Alpha and beta edit the same file; gamma is independent.
    env.commit_in_worktree(&run_id, "alpha", "shared.txt", "alpha version\n");
    env.commit_in_worktree(&run_id, "beta", "shared.txt", "beta version\n");
    env.commit_in_worktree(&run_id, "gamma", "gamma.txt", "gamma\n");

    env.complete_worker(&run_id, 1, "alpha");
    env.complete_worker(&run_id, 1, "beta");
    env.complete_worker(&run_id, 1, "gamma");

    // The second merge conflicted: HEAD is restored, a resolver context
    // holds the remaining branch.
    let repo_dir = env.repo_dir();
    let git = GitCli::default();
    let repo = discover_repo(&repo_dir, &git).expect("discover");
    assert_eq!(current_branch(&repo, &git).expect("branch"), "main");

    let context = env
        .orch
        .resolvers
        .active_for_run(&run_id)
        .expect("resolver lookup")
        .expect("active context");
    assert_eq!(context.conflict_files, vec!["shared.txt".to_string()]);
    assert_eq!(context.remaining_branches.len(), 1);
    assert!(context.remaining_branches[0]
        .ends_with(&worker_id_for(&env.orch, &env.project, "gamma")));
    assert!(env
        .gateway
        .spawn_labels()
        .iter()
        .any(|label| label.contains("/resolver/")));

    // Stand in for the resolver agent: merge the conflicted branch on the
    // phase branch by hand and commit the resolution.
    let phase_branch = context.phase_branch.clone();
    let source = context.source_branch.clone();
    run_git(&repo_dir, &["checkout", &phase_branch]);
    let merge = std::process::Command::new("git")
        .args(["merge", &source])
        .current_dir(&repo_dir)
        .output()
        .expect("git merge");
    assert!(!merge.status.success(), "merge should conflict");
    fs::write(repo_dir.join("shared.txt"), "alpha and beta reconciled\n").expect("resolve");
    commit_all(&repo_dir, "resolve shared.txt conflict");
    run_git(&repo_dir, &["checkout", "main"]);

    env.orch
        .handle_worker_complete(&WorkerCompletePayload {
            run_id: run_id.0.clone(),
            step_order: None,
            task_id: Some(TaskId::new(format!("resolver:{}", context.id))),
            status: WebhookStatus::Completed,
            output: None,
            error: None,
        })
        .expect("resolver webhook");

    // Remaining branches merged; the phase branch now carries all three
    // workers' commits.
    assert!(
        branch_has_commits_beyond(&repo, &git, &phase_branch, "main").expect("count"),
        "phase branch should be ahead of main before final merge"
    );
    env.approve_reviews(&run_id, 1);

    let finished = env.orch.runs.get(&run_id).expect("get").expect("run");
    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(
        fs::read_to_string(repo_dir.join("shared.txt")).expect("read"),
        "alpha and beta reconciled\n"
    );
    assert!(repo_dir.join("gamma.txt").exists());

    let _ = fs::remove_dir_all(&env.root);
}

/// Worker id handling `task`, for asserting against resolver contexts.
fn worker_id_for(orch: &Orchestrator, project: &swarm_core::types::ProjectName, task: &str) -> String {
    orch.registry
        .get(project, &TaskId::new(task))
        .expect("registry")
        .expect("entry")
        .worker_id
        .0
        .clone()
}

#[test]
fn s6_crash_mid_phase_restart_and_late_webhook() {
    let doc = "\
- [ ] First @id(first) @role(builder)
- [ ] Second @id(second) @role(builder)
- [ ] Third @id(third) @role(builder)
";
    let mut env = setup("s6", doc);
    let run = env.orch.start_project_run(&env.project).expect("start run");
    let run_id = run.run_id.clone();
    assert_eq!(env.gateway.spawn_count(), 3);

    env.commit_in_worktree(&run_id, "first", "first.rs", "first\n");
    env.complete_worker(&run_id, 1, "first");
    env.commit_in_worktree(&run_id, "second", "second.rs", "second\n");
    env.complete_worker(&run_id, 1, "second");
    // Commit third's work before the crash; its webhook never arrived.
    env.commit_in_worktree(&run_id, "third", "third.rs", "third\n");

    // Process dies and comes back over the same data root.
    env.orch = Orchestrator::open(env.config.clone(), Box::new(env.gateway.clone()))
        .expect("reopen orchestrator");

    let recovered = env.orch.runs.get(&run_id).expect("get").expect("run");
    assert_eq!(recovered.status, RunStatus::Running);

    let phase = env
        .orch
        .collector
        .get(&run_id, 1)
        .expect("phase read")
        .expect("phase state");
    let running: Vec<_> = phase
        .workers
        .iter()
        .filter(|w| w.status == WorkerStatus::Running)
        .collect();
    assert_eq!(running.len(), 1, "one worker still running after restart");
    assert_eq!(running[0].task_id, TaskId::new("third"));

    let entry = env
        .orch
        .registry
        .get(&env.project, &TaskId::new("third"))
        .expect("registry")
        .expect("entry");
    assert_eq!(entry.status, WorkerStatus::Running);

    // The late webhook closes the phase normally.
    env.complete_worker(&run_id, 1, "third");
    env.approve_reviews(&run_id, 1);

    let finished = env.orch.runs.get(&run_id).expect("get").expect("run");
    assert_eq!(finished.status, RunStatus::Completed);

    // No duplicate ledger entries after the replayed fold.
    let items = env
        .orch
        .ledger
        .list(&ListFilter::default())
        .expect("ledger list");
    assert_eq!(items.len(), 3);

    for file in ["first.rs", "second.rs", "third.rs"] {
        assert!(env.repo_dir().join(file).exists(), "missing {file}");
    }

    let _ = fs::remove_dir_all(&env.root);
}

#[test]
fn replayed_worker_webhook_is_idempotent() {
    let env = setup("replay", "- [ ] Only @id(only) @role(builder)\n");
    let run = env.orch.start_project_run(&env.project).expect("start run");
    let run_id = run.run_id.clone();

    env.commit_in_worktree(&run_id, "only", "only.rs", "only\n");
    env.complete_worker(&run_id, 1, "only");
    env.approve_reviews(&run_id, 1);

    let spawns_before = env.gateway.spawn_count();
    let items_before = env
        .orch
        .ledger
        .list(&ListFilter::default())
        .expect("list")
        .len();

    // Replay the same webhook: terminal run, treated as an orphan.
    env.complete_worker(&run_id, 1, "only");

    assert_eq!(env.gateway.spawn_count(), spawns_before, "no duplicate spawn");
    assert_eq!(
        env.orch
            .ledger
            .list(&ListFilter::default())
            .expect("list")
            .len(),
        items_before
    );
    let finished = env.orch.runs.get(&run_id).expect("get").expect("run");
    assert_eq!(finished.status, RunStatus::Completed);

    let _ = fs::remove_dir_all(&env.root);
}

#[test]
fn review_chain_runs_strictly_in_order() {
    let env = setup("chain-order", "- [ ] Task @id(task) @role(builder)\n");
    let run = env.orch.start_project_run(&env.project).expect("start run");
    let run_id = run.run_id.clone();

    env.commit_in_worktree(&run_id, "task", "task.rs", "task\n");
    env.complete_worker(&run_id, 1, "task");

    let reviewer_labels = |env: &crate::testing::ScenarioEnv| {
        env.gateway
            .spawn_labels()
            .into_iter()
            .filter(|label| label.contains("/phase-1/"))
            .collect::<Vec<_>>()
    };

    // Only the first reviewer is spawned until it approves.
    assert_eq!(reviewer_labels(&env).len(), 1);
    assert!(reviewer_labels(&env)[0].ends_with("/reviewer"));

    env.orch
        .handle_review_result(&ReviewResultPayload {
            status: ReviewDecision::Approved,
            run_id: run_id.0.clone(),
            phase_number: 1,
            findings: Vec::new(),
            summary: None,
        })
        .expect("first approval");
    let labels = reviewer_labels(&env);
    assert_eq!(labels.len(), 2);
    assert!(labels[1].ends_with("/security-reviewer"));

    env.orch
        .handle_review_result(&ReviewResultPayload {
            status: ReviewDecision::Approved,
            run_id: run_id.0.clone(),
            phase_number: 1,
            findings: Vec::new(),
            summary: None,
        })
        .expect("second approval");
    let labels = reviewer_labels(&env);
    assert_eq!(labels.len(), 3);
    assert!(labels[2].ends_with("/designer"));

    let _ = fs::remove_dir_all(&env.root);
}
