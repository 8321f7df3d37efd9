//! Integration tests for resume, partial results and stall detection.

mod common;

use chrono::Duration as ChronoDuration;

use manuscript::config::StallSettings;
use manuscript::pipeline::NoopProgress;
use manuscript::planner::PLAN_SYSTEM_PROMPT;
use manuscript::provider::StubProvider;
use manuscript::{
    JobStatus, PipelineOutcome, RecommendedAction, Recovery, RecoveryError, ResumeStrategy,
    StallMonitor,
};

use common::{section, OutlineBuilder, TestHarness};

#[tokio::test]
async fn test_resume_generates_only_missing_units() {
    let outline = OutlineBuilder::with_units("Volcanoes", 4);
    let harness = TestHarness::new(StubProvider::new("primary").with_default_reply("Lava."));
    let job = harness.seed_failed_job(&outline.build(), &[0, 1, 3]);
    assert_eq!(job.completed_units, 3);

    let plan = Recovery::new(harness.store.clone())
        .prepare_resume(&job.id, ResumeStrategy::ReuseOutline)
        .unwrap();
    assert_eq!(plan.status, JobStatus::GeneratingUnits);
    assert_eq!(plan.missing, vec![2]);

    let outcome = harness
        .pipeline()
        .run(&job.id, ResumeStrategy::ReuseOutline, &NoopProgress)
        .await;
    assert_eq!(outcome, PipelineOutcome::Completed);

    assert_eq!(harness.primary.call_count(), 1);
    assert_eq!(harness.primary.calls_matching(&section(2, 4)), 1);
    assert_eq!(harness.primary.calls_matching(PLAN_SYSTEM_PROMPT), 0);

    let units = harness.store.units(&job.id).unwrap();
    assert_eq!(units[0].content, "Seeded content for Part 1");
    assert_eq!(units[2].content, "Lava.");
    assert_eq!(units[3].content, "Seeded content for Part 4");

    let job = harness.job(&job.id);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress_percent, 100);
    assert!(job.error_message.is_none());
}

#[tokio::test]
async fn test_resume_with_every_unit_stored_goes_to_assembly() {
    let outline = OutlineBuilder::with_units("Islands", 2);
    let harness = TestHarness::new(StubProvider::new("primary"));
    let job = harness.seed_failed_job(&outline.build(), &[0, 1]);

    let plan = Recovery::new(harness.store.clone())
        .prepare_resume(&job.id, ResumeStrategy::ReuseOutline)
        .unwrap();
    assert_eq!(plan.status, JobStatus::Assembling);
    assert!(plan.missing.is_empty());

    let outcome = harness
        .pipeline()
        .run(&job.id, ResumeStrategy::ReuseOutline, &NoopProgress)
        .await;
    assert_eq!(outcome, PipelineOutcome::Completed);
    assert_eq!(harness.primary.call_count(), 0);
}

#[tokio::test]
async fn test_regenerate_outline_keeps_stored_units() {
    let old = OutlineBuilder::with_units("Old Plan", 3);
    let fresh = OutlineBuilder::new("New Plan")
        .unit("Fresh opening")
        .unit("Fresh middle")
        .unit("Fresh ending");
    let harness = TestHarness::new(
        StubProvider::new("primary").reply_when(PLAN_SYSTEM_PROMPT, fresh.reply()),
    );
    let job = harness.seed_failed_job(&old.build(), &[0]);

    let plan = Recovery::new(harness.store.clone())
        .prepare_resume(&job.id, ResumeStrategy::RegenerateOutline)
        .unwrap();
    assert_eq!(plan.status, JobStatus::Planning);

    let outcome = harness
        .pipeline()
        .run(&job.id, ResumeStrategy::RegenerateOutline, &NoopProgress)
        .await;
    assert_eq!(outcome, PipelineOutcome::Completed);

    let job = harness.job(&job.id);
    assert_eq!(job.outline.as_ref().unwrap().title, "New Plan");
    let units = harness.store.units(&job.id).unwrap();
    assert_eq!(units[0].title, "Part 1");
    assert_eq!(units[0].content, "Seeded content for Part 1");
    assert_eq!(units[1].title, "Fresh middle");

    let artifact = harness.store.artifact(&job.id).unwrap().unwrap();
    assert!(artifact.content.starts_with("# New Plan\n"));
}

#[tokio::test]
async fn test_regenerated_outline_with_other_unit_count_fails() {
    let old = OutlineBuilder::with_units("Old Plan", 3);
    let shorter = OutlineBuilder::with_units("Shorter", 2);
    let harness = TestHarness::new(
        StubProvider::new("primary").reply_when(PLAN_SYSTEM_PROMPT, shorter.reply()),
    );
    let job = harness.seed_failed_job(&old.build(), &[0]);

    Recovery::new(harness.store.clone())
        .prepare_resume(&job.id, ResumeStrategy::RegenerateOutline)
        .unwrap();
    let outcome = harness
        .pipeline()
        .run(&job.id, ResumeStrategy::RegenerateOutline, &NoopProgress)
        .await;

    let PipelineOutcome::Failed(message) = outcome else {
        panic!("expected a failed run, got {:?}", outcome);
    };
    assert!(message.starts_with("Outline planning failed"));
    assert!(message.contains("2 units but 3"));

    let job = harness.job(&job.id);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.outline.unwrap().title, "Old Plan");
    assert_eq!(harness.store.unit_count(&job.id).unwrap(), 1);
}

#[tokio::test]
async fn test_partial_read_and_save() {
    let outline = OutlineBuilder::with_units("Meadows", 3);
    let harness = TestHarness::new(StubProvider::new("primary"));
    let job = harness.seed_failed_job(&outline.build(), &[0, 2]);
    let recovery = Recovery::new(harness.store.clone());

    let preview = recovery.get_partial(&job.id).unwrap();
    assert!(preview.is_partial);
    assert!(preview.content.contains("## Part 1"));
    assert!(!preview.content.contains("## Part 2"));
    assert!(preview.content.contains("## Part 3"));
    assert!(harness.store.artifact(&job.id).unwrap().is_none());
    assert_eq!(harness.job(&job.id).status, JobStatus::Failed);

    let saved = recovery.save_partial(&job.id).unwrap();
    assert!(saved.is_partial);
    assert_eq!(saved.content, preview.content);

    let job = harness.job(&job.id);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_units, 2);
    assert_eq!(job.total_units, 3);
    assert!(job.completed_at.is_some());

    // A completed job can be neither resumed nor saved again.
    assert!(matches!(
        recovery.prepare_resume(&job.id, ResumeStrategy::ReuseOutline),
        Err(RecoveryError::InvalidState { .. })
    ));
    assert!(matches!(
        recovery.save_partial(&job.id),
        Err(RecoveryError::InvalidState { .. })
    ));
    assert!(matches!(
        recovery.cancel(&job.id),
        Err(RecoveryError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_partial_without_units_has_no_content() {
    let harness = TestHarness::new(StubProvider::new("primary"));
    let job = harness.create_job("Nothing yet");

    let err = Recovery::new(harness.store.clone())
        .get_partial(&job.id)
        .unwrap_err();
    assert!(matches!(err, RecoveryError::NoContent(_)));
}

#[test]
fn test_stall_detection_uses_status_budget() {
    let outline = OutlineBuilder::with_units("Tundra", 2);
    let harness = TestHarness::new(StubProvider::new("primary"));
    let job = harness.create_job("Tundra");
    harness.store.set_outline(&job.id, &outline.build()).unwrap();
    for status in [JobStatus::Planning, JobStatus::GeneratingUnits] {
        assert!(harness
            .store
            .transition(&job.id, &JobStatus::ACTIVE, status, "moving")
            .unwrap());
    }

    let monitor = StallMonitor::new(harness.store.clone(), StallSettings::default());
    let job = harness.job(&job.id);

    let fresh = monitor.assess(&job, job.updated_at + ChronoDuration::seconds(10));
    assert!(!fresh.stalled);
    assert!(fresh.recommended_actions.is_empty());

    let later = job.updated_at + ChronoDuration::seconds(601);
    let stale = monitor.assess(&job, later);
    assert!(stale.stalled);
    assert_eq!(stale.budget_secs, Some(600));
    assert_eq!(
        stale.recommended_actions,
        vec![RecommendedAction::Resume, RecommendedAction::Cancel]
    );

    harness.seed_unit(&job.id, &outline.build(), 0);
    let job = harness.job(&job.id);
    let stale = monitor.assess(&job, job.updated_at + ChronoDuration::seconds(601));
    assert!(stale
        .recommended_actions
        .contains(&RecommendedAction::SavePartial));

    let swept = monitor
        .sweep(job.updated_at + ChronoDuration::seconds(601))
        .unwrap();
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].0.id, job.id);

    // Assessing never writes.
    assert_eq!(harness.job(&job.id).updated_at, job.updated_at);
}
