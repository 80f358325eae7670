use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tempfile::TempDir;

use crate::window::{PlanTier, WindowViolation};

use super::{
    CreateJobRequest, Dispatcher, ExecutionError, JobAction, JobEngine, JobStatus, NewPostRequest,
    NoopExecutor, PostStatus, ReportOutcome, ScheduleError,
};

fn open_engine(temp: &TempDir) -> JobEngine {
    JobEngine::open(
        temp.path().join("jobs.db"),
        StdDuration::from_secs(600),
    )
    .expect("open engine")
}

fn open_engine_with_lease(temp: &TempDir, lease_secs: u64) -> JobEngine {
    JobEngine::open(
        temp.path().join("jobs.db"),
        StdDuration::from_secs(lease_secs),
    )
    .expect("open engine")
}

fn publish_request(user_id: &str, run_at: chrono::DateTime<Utc>) -> CreateJobRequest {
    CreateJobRequest {
        user_id: user_id.to_string(),
        job_type: "publish-post".to_string(),
        run_at,
        priority: 0,
        max_attempts: 3,
        retry_backoff_seconds: 60,
        payload: json!({ "source": "test" }),
        post: Some(NewPostRequest {
            title: "Launch day".to_string(),
            caption: "We are live".to_string(),
            target: "r/announcements".to_string(),
            media_urls: vec!["https://cdn.example.com/one.png".to_string()],
            nsfw: false,
            spoiler: false,
        }),
    }
}

#[test]
fn create_job_starts_pending_with_free_lease_slot() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine(&temp);
    let run_at = Utc::now() + Duration::days(2);
    let record = engine
        .create_job(PlanTier::Creator, publish_request("user-1", run_at))
        .expect("create job");

    assert_eq!(record.job.status, JobStatus::Pending);
    assert_eq!(record.job.attempts, 0);
    assert!(record.job.locked_at.is_none());
    assert!(record.job.locked_by.is_none());
    assert!(record.job.retry_at.is_none());
    assert_eq!(record.job.payload["source"], json!("test"));
    let post = record.post.expect("post created with job");
    assert_eq!(post.status, PostStatus::Pending);
    assert_eq!(post.scheduled_for, record.job.run_at);
    assert!(record.attempts.is_empty());
}

#[test]
fn create_job_sanitizes_payload_before_persistence() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine(&temp);
    let mut request = publish_request("user-1", Utc::now() + Duration::days(1));
    request.payload = json!({ "note  key!": "  spaced\u{0000}   text  ", "drop": null });
    let record = engine
        .create_job(PlanTier::Creator, request)
        .expect("create job");
    assert_eq!(record.job.payload.get("notekey"), Some(&json!("spaced text")));
    assert!(!record.job.payload.contains_key("drop"));
}

#[test]
fn create_job_rejects_window_violations_without_state_change() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine(&temp);
    let now = Utc::now();

    let too_soon = engine.create_job(
        PlanTier::Creator,
        publish_request("user-1", now + Duration::seconds(10)),
    );
    match too_soon {
        Err(ScheduleError::Window(WindowViolation::LeadTimeTooShort)) => {}
        other => panic!("expected lead time violation, got {other:?}"),
    }

    let free_tier = engine.create_job(
        PlanTier::Free,
        publish_request("user-1", now + Duration::days(1)),
    );
    match free_tier {
        Err(ScheduleError::Window(WindowViolation::SchedulingUnavailable)) => {}
        other => panic!("expected plan violation, got {other:?}"),
    }

    let too_far = engine.create_job(
        PlanTier::Studio,
        publish_request("user-1", now + Duration::days(40)),
    );
    match too_far {
        Err(ScheduleError::Window(WindowViolation::HorizonExceeded { max_days: 30 })) => {}
        other => panic!("expected horizon violation, got {other:?}"),
    }

    let jobs = engine
        .list_jobs("user-1", &[], 50)
        .expect("list jobs");
    assert!(jobs.is_empty());
}

#[test]
fn claim_sets_queue_status_and_lease() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine(&temp);
    let due_at = Utc::now() + Duration::hours(1);
    let record = engine
        .create_job(PlanTier::Creator, publish_request("user-1", due_at))
        .expect("create job");

    let claimed = engine
        .claim_next("worker-a", due_at + Duration::seconds(1))
        .expect("claim")
        .expect("job claimable once due");
    assert_eq!(claimed.job.id, record.job.id);
    assert_eq!(claimed.job.status, JobStatus::Queued);
    assert_eq!(claimed.job.locked_by.as_deref(), Some("worker-a"));
    assert!(claimed.job.locked_at.is_some());
    assert!(claimed.post.is_some());
}

#[test]
fn claim_skips_jobs_that_are_not_due() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine(&temp);
    engine
        .create_job(
            PlanTier::Creator,
            publish_request("user-1", Utc::now() + Duration::hours(1)),
        )
        .expect("create job");
    let claimed = engine.claim_next("worker-a", Utc::now()).expect("claim");
    assert!(claimed.is_none());
}

#[test]
fn second_claim_observes_live_lease() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine(&temp);
    let due_at = Utc::now() + Duration::hours(1);
    engine
        .create_job(PlanTier::Creator, publish_request("user-1", due_at))
        .expect("create job");

    let poll_at = due_at + Duration::seconds(1);
    let first = engine.claim_next("worker-a", poll_at).expect("claim");
    assert!(first.is_some());
    let second = engine.claim_next("worker-b", poll_at).expect("claim");
    assert!(second.is_none());
}

#[test]
fn concurrent_claims_have_exactly_one_winner() {
    let temp = TempDir::new().expect("tempdir");
    let engine = Arc::new(open_engine(&temp));
    let due_at = Utc::now() + Duration::hours(1);
    engine
        .create_job(PlanTier::Creator, publish_request("user-1", due_at))
        .expect("create job");

    let poll_at = due_at + Duration::seconds(1);
    let mut handles = Vec::new();
    for worker in ["worker-a", "worker-b", "worker-c", "worker-d"] {
        let engine = engine.clone();
        handles.push(std::thread::spawn(move || {
            engine.claim_next(worker, poll_at).expect("claim")
        }));
    }
    let winners = handles
        .into_iter()
        .filter_map(|handle| handle.join().expect("join"))
        .count();
    assert_eq!(winners, 1);
}

#[test]
fn expired_lease_is_silently_reclaimable() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine_with_lease(&temp, 1);
    let due_at = Utc::now() + Duration::hours(1);
    engine
        .create_job(PlanTier::Creator, publish_request("user-1", due_at))
        .expect("create job");

    let first_poll = due_at + Duration::seconds(1);
    let first = engine
        .claim_next("worker-a", first_poll)
        .expect("claim")
        .expect("first claim");
    assert_eq!(first.job.locked_by.as_deref(), Some("worker-a"));

    // worker-a never reports back; after the lease window the job is free.
    let second = engine
        .claim_next("worker-b", first_poll + Duration::seconds(2))
        .expect("claim")
        .expect("reclaim after expiry");
    assert_eq!(second.job.locked_by.as_deref(), Some("worker-b"));
    assert_eq!(second.job.status, JobStatus::Queued);
}

#[test]
fn equal_due_times_prefer_higher_priority() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine(&temp);
    let due_at = Utc::now() + Duration::hours(1);
    let mut low = publish_request("user-1", due_at);
    low.priority = 1;
    let mut high = publish_request("user-1", due_at);
    high.priority = 9;
    engine.create_job(PlanTier::Creator, low).expect("create low");
    let high_record = engine
        .create_job(PlanTier::Creator, high)
        .expect("create high");

    let claimed = engine
        .claim_next("worker-a", due_at + Duration::seconds(1))
        .expect("claim")
        .expect("one job claimable");
    assert_eq!(claimed.job.id, high_record.job.id);
}

#[test]
fn transient_failures_back_off_then_exhaust() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine(&temp);
    let due_at = Utc::now() + Duration::hours(1);
    let record = engine
        .create_job(PlanTier::Creator, publish_request("user-1", due_at))
        .expect("create job");
    let job_id = record.job.id;
    let boom = ExecutionError::Transient("platform unavailable".to_string());

    // First failure: retried one backoff unit out.
    let mut poll_at = due_at + Duration::seconds(1);
    let claimed = engine
        .claim_next("worker-a", poll_at)
        .expect("claim")
        .expect("first claim");
    let outcome = engine
        .report_failure(&claimed, &boom, poll_at)
        .expect("report failure");
    assert_eq!(outcome, ReportOutcome::RetryAt(poll_at + Duration::seconds(60)));
    let after_first = engine.get_job("user-1", job_id).expect("reload");
    assert_eq!(after_first.job.status, JobStatus::Pending);
    assert_eq!(after_first.job.attempts, 1);
    assert_eq!(after_first.job.retry_at, Some(poll_at + Duration::seconds(60)));
    assert_eq!(after_first.job.run_at, poll_at + Duration::seconds(60));
    assert!(after_first.job.locked_at.is_none());
    assert!(after_first.job.locked_by.is_none());
    let last_error = after_first.job.last_error.expect("last error recorded");
    assert!(last_error.contains("platform unavailable"));

    // Second failure: backoff doubles linearly.
    poll_at = poll_at + Duration::seconds(61);
    let claimed = engine
        .claim_next("worker-a", poll_at)
        .expect("claim")
        .expect("second claim");
    let outcome = engine
        .report_failure(&claimed, &boom, poll_at)
        .expect("report failure");
    assert_eq!(outcome, ReportOutcome::RetryAt(poll_at + Duration::seconds(120)));

    // Third failure exhausts the budget exactly at max_attempts.
    poll_at = poll_at + Duration::seconds(121);
    let claimed = engine
        .claim_next("worker-a", poll_at)
        .expect("claim")
        .expect("third claim");
    let outcome = engine
        .report_failure(&claimed, &boom, poll_at)
        .expect("report failure");
    assert_eq!(outcome, ReportOutcome::Failed);
    let exhausted = engine.get_job("user-1", job_id).expect("reload");
    assert_eq!(exhausted.job.status, JobStatus::Failed);
    assert_eq!(exhausted.job.attempts, 3);
    assert!(exhausted.job.retry_at.is_none());
    assert!(exhausted.job.last_error.is_some());
    let post = exhausted.post.expect("post");
    assert_eq!(post.status, PostStatus::Failed);
}

#[test]
fn fatal_failure_skips_remaining_attempts() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine(&temp);
    let due_at = Utc::now() + Duration::hours(1);
    let record = engine
        .create_job(PlanTier::Creator, publish_request("user-1", due_at))
        .expect("create job");

    let poll_at = due_at + Duration::seconds(1);
    let claimed = engine
        .claim_next("worker-a", poll_at)
        .expect("claim")
        .expect("claim");
    let outcome = engine
        .report_failure(
            &claimed,
            &ExecutionError::Fatal("target community does not exist".to_string()),
            poll_at,
        )
        .expect("report failure");
    assert_eq!(outcome, ReportOutcome::Failed);
    let reloaded = engine.get_job("user-1", record.job.id).expect("reload");
    assert_eq!(reloaded.job.status, JobStatus::Failed);
    assert_eq!(reloaded.job.attempts, 1);
}

#[test]
fn success_marks_job_succeeded_and_post_sent() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine(&temp);
    let due_at = Utc::now() + Duration::hours(1);
    let record = engine
        .create_job(PlanTier::Creator, publish_request("user-1", due_at))
        .expect("create job");

    let poll_at = due_at + Duration::seconds(1);
    let claimed = engine
        .claim_next("worker-a", poll_at)
        .expect("claim")
        .expect("claim");
    let outcome = engine.report_success(&claimed, poll_at).expect("report");
    assert_eq!(outcome, ReportOutcome::Succeeded);

    let reloaded = engine.get_job("user-1", record.job.id).expect("reload");
    assert_eq!(reloaded.job.status, JobStatus::Succeeded);
    assert_eq!(reloaded.job.attempts, 1);
    assert!(reloaded.job.locked_at.is_none());
    assert!(reloaded.job.locked_by.is_none());
    assert_eq!(reloaded.job.last_run_at, Some(poll_at));
    assert_eq!(reloaded.post.expect("post").status, PostStatus::Sent);
}

#[test]
fn cancel_rejects_terminal_jobs_without_touching_them() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine(&temp);
    let due_at = Utc::now() + Duration::hours(1);
    let record = engine
        .create_job(PlanTier::Creator, publish_request("user-1", due_at))
        .expect("create job");
    let job_id = record.job.id;

    let poll_at = due_at + Duration::seconds(1);
    let claimed = engine
        .claim_next("worker-a", poll_at)
        .expect("claim")
        .expect("claim");
    engine.report_success(&claimed, poll_at).expect("report");

    let rejected = engine.apply_action(
        "user-1",
        job_id,
        PlanTier::Creator,
        JobAction::Cancel { reason: None },
    );
    match rejected {
        Err(ScheduleError::Conflict(message)) => {
            assert!(message.contains("succeeded"));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    let untouched = engine.get_job("user-1", job_id).expect("reload");
    assert_eq!(untouched.job.status, JobStatus::Succeeded);
    assert_eq!(untouched.post.expect("post").status, PostStatus::Sent);
}

#[test]
fn cancel_pending_job_updates_post_in_lockstep() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine(&temp);
    let record = engine
        .create_job(
            PlanTier::Creator,
            publish_request("user-1", Utc::now() + Duration::days(1)),
        )
        .expect("create job");

    let cancelled = engine
        .apply_action(
            "user-1",
            record.job.id,
            PlanTier::Creator,
            JobAction::Cancel {
                reason: Some("changed my mind".to_string()),
            },
        )
        .expect("cancel");
    assert_eq!(cancelled.job.status, JobStatus::Cancelled);
    assert_eq!(cancelled.post.expect("post").status, PostStatus::Cancelled);

    let again = engine.apply_action(
        "user-1",
        record.job.id,
        PlanTier::Creator,
        JobAction::Cancel { reason: None },
    );
    assert!(matches!(again, Err(ScheduleError::Conflict(_))));
}

#[test]
fn cancellation_beats_inflight_result() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine(&temp);
    let due_at = Utc::now() + Duration::hours(1);
    let record = engine
        .create_job(PlanTier::Creator, publish_request("user-1", due_at))
        .expect("create job");

    let poll_at = due_at + Duration::seconds(1);
    let claimed = engine
        .claim_next("worker-a", poll_at)
        .expect("claim")
        .expect("claim");

    // Owner cancels while the worker is still executing.
    let cancelled = engine
        .apply_action(
            "user-1",
            record.job.id,
            PlanTier::Creator,
            JobAction::Cancel { reason: None },
        )
        .expect("cancel mid-flight");
    assert_eq!(cancelled.job.status, JobStatus::Cancelled);

    let outcome = engine
        .report_success(&claimed, poll_at + Duration::seconds(5))
        .expect("report");
    assert_eq!(outcome, ReportOutcome::Discarded);
    let reloaded = engine.get_job("user-1", record.job.id).expect("reload");
    assert_eq!(reloaded.job.status, JobStatus::Cancelled);
    assert_eq!(reloaded.job.attempts, 0);
}

#[test]
fn reschedule_clears_lease_and_retry_state() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine(&temp);
    let due_at = Utc::now() + Duration::hours(1);
    let record = engine
        .create_job(PlanTier::Creator, publish_request("user-1", due_at))
        .expect("create job");

    let poll_at = due_at + Duration::seconds(1);
    engine
        .claim_next("worker-a", poll_at)
        .expect("claim")
        .expect("claim");

    let new_run_at = Utc::now() + Duration::days(3);
    let rescheduled = engine
        .apply_action(
            "user-1",
            record.job.id,
            PlanTier::Creator,
            JobAction::Reschedule { run_at: new_run_at },
        )
        .expect("reschedule");
    assert_eq!(rescheduled.job.status, JobStatus::Pending);
    assert_eq!(rescheduled.job.run_at, new_run_at);
    assert!(rescheduled.job.retry_at.is_none());
    assert!(rescheduled.job.locked_at.is_none());
    assert!(rescheduled.job.locked_by.is_none());
    let post = rescheduled.post.expect("post");
    assert_eq!(post.status, PostStatus::Pending);
    assert_eq!(post.scheduled_for, new_run_at);
}

#[test]
fn reschedule_outside_window_leaves_job_unchanged() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine(&temp);
    let run_at = Utc::now() + Duration::days(2);
    let record = engine
        .create_job(PlanTier::Studio, publish_request("user-1", run_at))
        .expect("create job");

    let rejected = engine.apply_action(
        "user-1",
        record.job.id,
        PlanTier::Studio,
        JobAction::Reschedule {
            run_at: Utc::now() + Duration::days(40),
        },
    );
    match rejected {
        Err(ScheduleError::Window(WindowViolation::HorizonExceeded { max_days: 30 })) => {}
        other => panic!("expected horizon violation, got {other:?}"),
    }
    let untouched = engine.get_job("user-1", record.job.id).expect("reload");
    assert_eq!(untouched.job.status, JobStatus::Pending);
    assert_eq!(untouched.job.run_at, record.job.run_at);
}

#[test]
fn force_run_queues_immediately_and_is_claimable_now() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine(&temp);
    let record = engine
        .create_job(
            PlanTier::Creator,
            publish_request("user-1", Utc::now() + Duration::days(1)),
        )
        .expect("create job");

    let before = Utc::now();
    let forced = engine
        .apply_action(
            "user-1",
            record.job.id,
            PlanTier::Creator,
            JobAction::ForceRun,
        )
        .expect("force run");
    assert_eq!(forced.job.status, JobStatus::Queued);
    assert!(forced.job.run_at >= before);
    assert!(forced.job.run_at <= Utc::now() + Duration::seconds(5));
    assert!(forced.job.locked_at.is_none());
    assert!(forced.job.locked_by.is_none());

    let claimed = engine
        .claim_next("worker-a", Utc::now())
        .expect("claim")
        .expect("forced job claimable immediately");
    assert_eq!(claimed.job.id, record.job.id);
}

#[test]
fn attempt_history_is_contiguous_and_newest_first() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine(&temp);
    let due_at = Utc::now() + Duration::hours(1);
    let record = engine
        .create_job(PlanTier::Creator, publish_request("user-1", due_at))
        .expect("create job");
    let boom = ExecutionError::Transient("boom".to_string());

    let mut poll_at = due_at + Duration::seconds(1);
    for _ in 0..2 {
        let claimed = engine
            .claim_next("worker-a", poll_at)
            .expect("claim")
            .expect("claim");
        let attempt_id = engine.start_attempt(&claimed, poll_at).expect("start");
        engine
            .finish_attempt(attempt_id, poll_at, Some("boom"), None)
            .expect("finish");
        engine
            .report_failure(&claimed, &boom, poll_at)
            .expect("report");
        poll_at = poll_at + Duration::seconds(200);
    }
    let claimed = engine
        .claim_next("worker-a", poll_at)
        .expect("claim")
        .expect("claim");
    let attempt_id = engine.start_attempt(&claimed, poll_at).expect("start");
    engine
        .finish_attempt(attempt_id, poll_at, None, Some(&json!({"postId": "abc"})))
        .expect("finish");
    engine.report_success(&claimed, poll_at).expect("report");

    let reloaded = engine.get_job("user-1", record.job.id).expect("reload");
    let numbers = reloaded
        .attempts
        .iter()
        .map(|attempt| attempt.attempt_number)
        .collect::<Vec<_>>();
    assert_eq!(numbers, vec![3, 2, 1]);
    assert_eq!(
        reloaded.attempts[0].result,
        Some(json!({"postId": "abc"}))
    );
    assert_eq!(reloaded.attempts[1].error.as_deref(), Some("boom"));
}

#[test]
fn dispatcher_executes_forced_job_end_to_end() {
    let temp = TempDir::new().expect("tempdir");
    let engine = Arc::new(open_engine(&temp));
    let record = engine
        .create_job(
            PlanTier::Creator,
            publish_request("user-1", Utc::now() + Duration::days(1)),
        )
        .expect("create job");
    engine
        .apply_action(
            "user-1",
            record.job.id,
            PlanTier::Creator,
            JobAction::ForceRun,
        )
        .expect("force run");

    let dispatcher = Dispatcher::new(engine.clone(), NoopExecutor, "worker-test");
    let executed = dispatcher.drain_due().expect("drain");
    assert_eq!(executed, 1);

    let reloaded = engine.get_job("user-1", record.job.id).expect("reload");
    assert_eq!(reloaded.job.status, JobStatus::Succeeded);
    assert_eq!(reloaded.attempts.len(), 1);
    assert_eq!(reloaded.attempts[0].attempt_number, 1);
    assert!(reloaded.attempts[0].finished_at.is_some());
}

#[test]
fn list_jobs_filters_orders_and_limits() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine(&temp);
    let now = Utc::now();
    let later = engine
        .create_job(PlanTier::Creator, publish_request("user-1", now + Duration::days(3)))
        .expect("create");
    let sooner = engine
        .create_job(PlanTier::Creator, publish_request("user-1", now + Duration::days(1)))
        .expect("create");
    let cancelled = engine
        .create_job(PlanTier::Creator, publish_request("user-1", now + Duration::days(2)))
        .expect("create");
    engine
        .apply_action(
            "user-1",
            cancelled.job.id,
            PlanTier::Creator,
            JobAction::Cancel { reason: None },
        )
        .expect("cancel");
    engine
        .create_job(PlanTier::Creator, publish_request("user-2", now + Duration::days(1)))
        .expect("create for other user");

    let pending_only = engine
        .list_jobs("user-1", &[JobStatus::Pending], 50)
        .expect("list pending");
    let ids = pending_only
        .iter()
        .map(|record| record.job.id)
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![sooner.job.id, later.job.id]);

    let everything = engine.list_jobs("user-1", &[], 50).expect("list all");
    assert_eq!(everything.len(), 3);
    // 'cancelled' sorts before 'pending' in the status-first ordering.
    assert_eq!(everything[0].job.id, cancelled.job.id);

    let limited = engine.list_jobs("user-1", &[], 1).expect("list limited");
    assert_eq!(limited.len(), 1);
}

#[test]
fn foreign_jobs_are_indistinguishable_from_missing() {
    let temp = TempDir::new().expect("tempdir");
    let engine = open_engine(&temp);
    let record = engine
        .create_job(
            PlanTier::Creator,
            publish_request("user-1", Utc::now() + Duration::days(1)),
        )
        .expect("create job");

    let foreign = engine.get_job("user-2", record.job.id);
    assert!(matches!(foreign, Err(ScheduleError::NotFound(_))));
    let foreign_action = engine.apply_action(
        "user-2",
        record.job.id,
        PlanTier::Creator,
        JobAction::ForceRun,
    );
    assert!(matches!(foreign_action, Err(ScheduleError::NotFound(_))));
}
