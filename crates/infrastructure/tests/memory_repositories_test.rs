use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use scheduler_core::{LeaseStore, SchedulerError};
use scheduler_domain::entities::{
    JobExecution, JobRequestInfo, JobState, JobTypeCronTrigger,
};
use scheduler_domain::repositories::*;
use scheduler_infrastructure::database::memory::{
    MemoryJobExecutionRepository, MemoryJobRequestRepository, MemoryLeaseStore,
};

fn trigger(user: &str, job_type: &str) -> JobTypeCronTrigger {
    JobTypeCronTrigger {
        user_id: user.to_string(),
        organization_id: None,
        job_type: job_type.to_string(),
        cron_trigger: "0 * * * *".to_string(),
    }
}

#[tokio::test]
async fn test_next_schedulable_orders_by_priority_then_age() -> Result<()> {
    let repo = MemoryJobRequestRepository::new();
    let base = Utc::now() - chrono::Duration::seconds(60);

    let mut low_old = JobRequestInfo::new("build", "alice").with_priority(5);
    low_old.created_at = base;
    let mut high = JobRequestInfo::new("build", "bob").with_priority(10);
    high.created_at = base + chrono::Duration::seconds(1);
    let mut low_new = JobRequestInfo::new("build", "carol").with_priority(5);
    low_new.created_at = base + chrono::Duration::seconds(2);
    let mut future = JobRequestInfo::new("build", "dave").with_priority(50);
    future.scheduled_at = Utc::now() + chrono::Duration::hours(1);

    let low_old = repo.save(&low_old).await?;
    let high = repo.save(&high).await?;
    let low_new = repo.save(&low_new).await?;
    repo.save(&future).await?;

    let batch = repo.next_schedulable_job_requests_by_type(&[], 10).await?;
    let ids: Vec<u64> = batch.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![high.id, low_old.id, low_new.id]);

    let limited = repo.next_schedulable_job_requests_by_type(&[], 1).await?;
    assert_eq!(limited.len(), 1);

    let other_type = repo
        .next_schedulable_job_requests_by_type(&["deploy".to_string()], 10)
        .await?;
    assert!(other_type.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_duplicate_user_key_is_rejected() -> Result<()> {
    let repo = MemoryJobRequestRepository::new();
    let mut first = JobRequestInfo::new("nightly", "alice");
    first.user_key = Some("alice-nightly-2024".to_string());
    repo.save(&first).await?;

    let err = repo.save(&first).await.unwrap_err();
    assert!(matches!(err, SchedulerError::StateConflict(_)));
    assert_eq!(repo.count().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_requeue_orphans_only_touches_stale_requests() -> Result<()> {
    let repo = MemoryJobRequestRepository::new();
    let stale = repo.save(&JobRequestInfo::new("build", "alice")).await?;
    let fresh = repo.save(&JobRequestInfo::new("build", "bob")).await?;
    let done = repo.save(&JobRequestInfo::new("build", "carol")).await?;

    let old = Utc::now() - chrono::Duration::minutes(10);
    repo.update_with(stale.id, |r| {
        r.job_state = JobState::Executing;
        r.updated_at = old;
    })
    .await?;
    repo.update_with(fresh.id, |r| r.job_state = JobState::Ready).await?;
    repo.update_with(done.id, |r| {
        r.job_state = JobState::Completed;
        r.updated_at = old;
    })
    .await?;

    let requeued = repo.requeue_orphan_job_requests(Duration::from_secs(60)).await?;
    assert_eq!(requeued, vec![stale.id]);
    assert_eq!(repo.get(stale.id).await?.job_state, JobState::Pending);
    assert_eq!(repo.get(fresh.id).await?.job_state, JobState::Ready);
    assert_eq!(repo.get(done.id).await?.job_state, JobState::Completed);

    // 第二轮不会重复改回
    let again = repo.requeue_orphan_job_requests(Duration::from_secs(60)).await?;
    assert!(again.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_state_transitions_are_compare_and_set() -> Result<()> {
    let repo = MemoryJobRequestRepository::new();
    let request = repo.save(&JobRequestInfo::new("build", "alice")).await?;

    repo.set_ready_to_execute(request.id, "exec-1").await?;
    let err = repo.set_ready_to_execute(request.id, "exec-2").await.unwrap_err();
    assert!(matches!(err, SchedulerError::StateConflict(_)));
    assert_eq!(
        repo.get(request.id).await?.last_job_execution_id.as_deref(),
        Some("exec-1")
    );

    assert!(repo.revert_to_pending(request.id).await?);
    assert!(!repo.revert_to_pending(request.id).await?);

    let updated = repo
        .update_job_state(
            request.id,
            &[JobState::Ready],
            JobState::Failed,
            Some("ERR_JOB_EXECUTE"),
            None,
        )
        .await?;
    assert!(!updated);
    assert_eq!(repo.get(request.id).await?.job_state, JobState::Pending);
    Ok(())
}

#[tokio::test]
async fn test_missing_cron_jobs() -> Result<()> {
    let repo = MemoryJobRequestRepository::new();
    let mut scheduled = JobRequestInfo::new("nightly", "alice");
    scheduled.cron_triggered = true;
    repo.save(&scheduled).await?;

    let triggers = vec![trigger("alice", "nightly"), trigger("bob", "nightly")];
    let missing = repo.find_missing_cron_scheduled_jobs_by_type(&triggers).await?;
    assert_eq!(missing, vec![trigger("bob", "nightly")]);
    Ok(())
}

#[tokio::test]
async fn test_execution_repository_rejects_second_live_execution() -> Result<()> {
    let requests = MemoryJobRequestRepository::new();
    let executions = MemoryJobExecutionRepository::new();
    let request = requests.save(&JobRequestInfo::new("build", "alice")).await?;

    let first = executions
        .create(&JobExecution::for_request(&request, Vec::new()))
        .await?;
    let err = executions
        .create(&JobExecution::for_request(&request, Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::StateConflict(_)));

    executions.update_state(&first.id, JobState::Completed).await?;
    executions
        .create(&JobExecution::for_request(&request, Vec::new()))
        .await?;
    assert_eq!(executions.find_by_request(request.id).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_lease_store_single_holder() -> Result<()> {
    let leases = MemoryLeaseStore::new();
    let ttl = Duration::from_secs(30);

    assert!(leases.try_acquire("leader", "scheduler-a", ttl).await?);
    assert!(!leases.try_acquire("leader", "scheduler-b", ttl).await?);
    assert!(leases.try_acquire("leader", "scheduler-a", ttl).await?);
    assert_eq!(leases.holder("leader").await?.as_deref(), Some("scheduler-a"));

    leases.expire("leader").await;
    assert!(leases.try_acquire("leader", "scheduler-b", ttl).await?);

    leases.release("leader", "scheduler-a").await?;
    assert_eq!(leases.holder("leader").await?.as_deref(), Some("scheduler-b"));
    Ok(())
}
