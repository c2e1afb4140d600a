mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::FutureExt;

use common::{shell_job, Harness, LAUNCH_TOPIC};
use scheduler_core::config::JobsConfig;
use scheduler_core::SchedulerError;
use scheduler_dispatcher::{PassResult, ResourceManager, ScheduleOutcome};
use scheduler_domain::entities::{
    ErrorCategory, FilterOp, FilterRule, JobExecution, JobState, DELETE_FILTERED_CRON_JOBS,
};
use scheduler_domain::repositories::{JobExecutionRepository, JobRequestRepository};
use scheduler_infrastructure::DependencyHealthMonitor;

/// 数据库检查耗时 `delay` 后才返回健康
fn slow_database(delay: Duration) -> Arc<DependencyHealthMonitor> {
    Arc::new(
        DependencyHealthMonitor::new(Duration::from_secs(60)).with_check("database", move || {
            async move {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            .boxed()
        }),
    )
}

#[tokio::test]
async fn test_pass_without_ants_keeps_request_pending() -> Result<()> {
    let h = Harness::new();
    let request = h.submit(&shell_job("build")).await;

    let result = h.scheduler.schedule_pass().await?;
    assert_eq!(
        result,
        PassResult::Completed {
            checked: 1,
            progressed: 1,
            scheduled: 0
        }
    );

    let stored = h.request(request.id).await;
    assert_eq!(stored.job_state, JobState::Pending);
    assert_eq!(stored.schedule_attempts, 1);
    assert!(stored.scheduled_at > request.scheduled_at);
    assert_eq!(h.scheduler.stats().no_jobs_tries, 0);
    assert!(h.queue.published(LAUNCH_TOPIC).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_pass_with_matching_ant_dispatches_once() -> Result<()> {
    let h = Harness::new();
    h.register_ant("ant-1", &["SHELL"], 4);
    let request = h.submit(&shell_job("build")).await;

    let result = h.scheduler.schedule_pass().await?;
    assert!(matches!(result, PassResult::Completed { scheduled: 1, .. }));

    let stored = h.request(request.id).await;
    assert_eq!(stored.job_state, JobState::Ready);
    let execution_id = stored.last_job_execution_id.clone().expect("执行id");
    let launches = h.queue.published(LAUNCH_TOPIC).await;
    assert_eq!(launches.len(), 1);
    let event: scheduler_domain::events::JobExecutionLaunchEvent = launches[0].decode()?;
    assert_eq!(event.job_execution_id, execution_id);
    assert_eq!(event.reservations.len(), 2);
    assert_eq!(h.resources.reservations_for(request.id).len(), 2);

    // 请求已不是PENDING，下一轮没有可调度的请求
    assert!(matches!(
        h.scheduler.schedule_pass().await,
        Err(SchedulerError::NoSchedulableJobs)
    ));
    assert_eq!(h.queue.published(LAUNCH_TOPIC).await.len(), 1);
    assert_eq!(h.scheduler.stats().total_scheduled_jobs, 1);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_attempts_never_double_dispatch() -> Result<()> {
    let h = Harness::new();
    h.register_ant("ant-1", &["SHELL"], 10);
    let request = h.submit(&shell_job("build")).await;

    let (a, b) = tokio::join!(
        h.state_machine(request.clone()).run(),
        h.state_machine(request.clone()).run()
    );
    let outcomes = [a?, b?];
    let scheduled = outcomes
        .iter()
        .filter(|o| matches!(o, ScheduleOutcome::Scheduled { .. }))
        .count();
    assert_eq!(scheduled, 1, "{outcomes:?}");
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, ScheduleOutcome::Skipped { .. })));

    assert_eq!(h.stores.job_executions.count().await, 1);
    assert_eq!(h.resources.reservations_for(request.id).len(), 2);
    assert_eq!(h.queue.published(LAUNCH_TOPIC).await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_retry_pushes_schedule_and_decays_priority() -> Result<()> {
    let h = Harness::new();
    let mut definition = shell_job("build");
    definition.priority = 7;
    let request = h.submit(&definition).await;

    let mut previous = h.request(request.id).await;
    for attempt in 1..=10u32 {
        let outcome = h.state_machine(previous.clone()).run().await?;
        assert!(matches!(outcome, ScheduleOutcome::Retry { attempts, .. } if attempts == attempt));

        let current = h.request(request.id).await;
        let expected_delay = (u64::from(attempt) * 5).min(30) as i64;
        assert_eq!(
            current.scheduled_at - previous.scheduled_at,
            chrono::Duration::seconds(expected_delay),
            "第{attempt}次重试"
        );
        assert_eq!(current.schedule_attempts, attempt);
        previous = current;

        match attempt {
            1..=4 => assert_eq!(previous.job_priority, 7),
            5..=9 => assert_eq!(previous.job_priority, 6),
            _ => assert_eq!(previous.job_priority, 5),
        }
    }
    assert_eq!(previous.job_state, JobState::Pending);

    // 已降到5，不再继续衰减
    for _ in 0..5 {
        h.state_machine(previous.clone()).run().await?;
        previous = h.request(request.id).await;
    }
    assert_eq!(previous.schedule_attempts, 15);
    assert_eq!(previous.job_priority, 5);
    Ok(())
}

#[tokio::test]
async fn test_exhausted_attempts_fail_with_ant_resources() -> Result<()> {
    let jobs = JobsConfig {
        leader_election_enabled: false,
        max_schedule_attempts: 2,
        ..JobsConfig::default()
    };
    let h = Harness::with_jobs(jobs);
    let request = h.submit(&shell_job("build")).await;

    for _ in 0..2 {
        let current = h.request(request.id).await;
        let outcome = h.state_machine(current).run().await?;
        assert!(matches!(outcome, ScheduleOutcome::Retry { .. }));
    }

    let current = h.request(request.id).await;
    let outcome = h.state_machine(current).run().await?;
    assert!(matches!(
        outcome,
        ScheduleOutcome::Failed {
            category: ErrorCategory::AntResourcesUnavailable,
            ..
        }
    ));
    let stored = h.request(request.id).await;
    assert_eq!(stored.job_state, JobState::Failed);
    assert_eq!(stored.error_code.as_deref(), Some("ERR_ANT_RESOURCES"));
    assert_eq!(stored.schedule_attempts, 2);
    Ok(())
}

#[tokio::test]
async fn test_publish_failure_reverts_to_pending() -> Result<()> {
    let h = Harness::new();
    h.register_ant("ant-1", &["SHELL"], 4);
    let request = h.submit(&shell_job("build")).await;
    h.queue.set_fail_publishes(true);

    let outcome = h.state_machine(request.clone()).run().await?;
    assert_eq!(outcome, ScheduleOutcome::Reverted);

    let stored = h.request(request.id).await;
    assert_eq!(stored.job_state, JobState::Pending);
    assert!(stored.last_job_execution_id.is_none());
    assert_eq!(h.stores.job_executions.count().await, 0);
    assert!(h.resources.reservations_for(request.id).is_empty());

    // 总线恢复后可以正常下发
    h.queue.set_fail_publishes(false);
    let outcome = h.state_machine(stored).run().await?;
    assert!(matches!(outcome, ScheduleOutcome::Scheduled { .. }));
    Ok(())
}

#[tokio::test]
async fn test_execution_store_failure_is_terminal() -> Result<()> {
    let h = Harness::new();
    h.register_ant("ant-1", &["SHELL"], 4);
    let request = h.submit(&shell_job("build")).await;
    h.stores.job_executions.set_unavailable(true);

    let outcome = h.state_machine(request.clone()).run().await?;
    assert!(matches!(
        outcome,
        ScheduleOutcome::Failed {
            category: ErrorCategory::JobExecuteFailure,
            ..
        }
    ));
    let stored = h.request(request.id).await;
    assert_eq!(stored.job_state, JobState::Failed);
    assert_eq!(stored.error_code.as_deref(), Some("ERR_JOB_EXECUTE"));
    assert!(h.resources.reservations_for(request.id).is_empty());
    assert!(h.queue.published(LAUNCH_TOPIC).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_request_store_failure_leaves_request_untouched() -> Result<()> {
    let h = Harness::new();
    let request = h.submit(&shell_job("build")).await;
    h.stores.job_requests.set_unavailable(true);

    assert!(matches!(
        h.scheduler.schedule_pass().await,
        Err(SchedulerError::BatchFetchFailure(_))
    ));
    assert_eq!(h.scheduler.stats().no_jobs_tries, 1);

    h.stores.job_requests.set_unavailable(false);
    assert_eq!(h.request(request.id).await.schedule_attempts, 0);
    Ok(())
}

#[tokio::test]
async fn test_filtered_request_is_failed() -> Result<()> {
    let h = Harness::new();
    h.register_ant("ant-1", &["SHELL"], 4);
    let mut definition = shell_job("build");
    definition.filters = vec![FilterRule::new("Branch", FilterOp::In, &["experimental"])];
    h.stores.job_definitions.insert(definition.clone()).await;

    let mut request = scheduler_domain::entities::JobRequestInfo::new("build", "alice")
        .with_definition(&definition);
    request.params = HashMap::from([("Branch".to_string(), "experimental".to_string())]);
    let request = h.stores.job_requests.save(&request).await?;

    let outcome = h.state_machine(request.clone()).run().await?;
    assert_eq!(outcome, ScheduleOutcome::Filtered { deleted: false });
    let stored = h.request(request.id).await;
    assert_eq!(stored.job_state, JobState::Failed);
    assert_eq!(stored.error_code.as_deref(), Some("ERR_FILTERED_JOB"));
    assert!(h.resources.reservations_for(request.id).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_filtered_cron_request_is_deleted() -> Result<()> {
    let h = Harness::new();
    let mut definition = shell_job("nightly");
    definition.cron_trigger = Some("0 2 * * *".to_string());
    definition
        .variables
        .insert(DELETE_FILTERED_CRON_JOBS.to_string(), serde_json::Value::Bool(true));
    definition.filters = vec![FilterRule::new("CronTriggered", FilterOp::Equals, &["true"])];
    h.stores.job_definitions.insert(definition.clone()).await;

    let request = scheduler_domain::entities::JobRequestInfo::from_definition(&definition, Utc::now())?;
    let request = h.stores.job_requests.save(&request).await?;

    let outcome = h.state_machine(request.clone()).run().await?;
    assert_eq!(outcome, ScheduleOutcome::Filtered { deleted: true });
    assert!(h.stores.job_requests.get(request.id).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_definition_concurrency_limit_defers_second_request() -> Result<()> {
    let h = Harness::new();
    h.register_ant("ant-1", &["SHELL"], 10);
    let mut definition = shell_job("build");
    definition.max_concurrency = 1;
    let first = h.submit(&definition).await;
    let second = h.submit(&definition).await;

    let result = h.scheduler.schedule_pass().await?;
    assert!(matches!(
        result,
        PassResult::Completed {
            checked: 2,
            scheduled: 1,
            ..
        }
    ));
    assert_eq!(h.request(first.id).await.job_state, JobState::Ready);
    let deferred = h.request(second.id).await;
    assert_eq!(deferred.job_state, JobState::Pending);
    assert_eq!(deferred.schedule_attempts, 1);

    let snapshot = h
        .stats
        .get_stats_by_key(&first.user_job_type_key())
        .expect("统计");
    assert_eq!(snapshot.executing_jobs, 1);
    assert!(!snapshot.ants_available);
    Ok(())
}

#[tokio::test]
async fn test_stale_attempt_never_touches_dispatched_request() -> Result<()> {
    let jobs = JobsConfig {
        leader_election_enabled: false,
        max_schedule_attempts: 2,
        ..JobsConfig::default()
    };
    let h = Harness::with_jobs(jobs);
    h.register_ant("ant-1", &["SHELL"], 10);
    let mut definition = shell_job("build");
    definition.max_concurrency = 1;
    let request = h.submit(&definition).await;
    h.stores
        .job_requests
        .update_with(request.id, |r| r.schedule_attempts = 2)
        .await?;
    let snapshot = h.request(request.id).await;

    let first = h.state_machine(snapshot.clone()).run().await?;
    assert!(matches!(first, ScheduleOutcome::Scheduled { .. }));

    // 第二次尝试拿着调度前的副本，且已用尽尝试次数
    let second = h.state_machine(snapshot.clone()).run().await?;
    assert!(matches!(second, ScheduleOutcome::Skipped { .. }), "{second:?}");

    let stored = h.request(request.id).await;
    assert_eq!(stored.job_state, JobState::Ready);
    assert!(stored.error_code.is_none());
    assert_eq!(stored.schedule_attempts, 2);
    assert_eq!(stored.scheduled_at, snapshot.scheduled_at);
    assert_eq!(h.resources.reservations_for(request.id).len(), 2);
    assert_eq!(h.queue.published(LAUNCH_TOPIC).await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_undeletable_execution_is_cancelled_on_revert() -> Result<()> {
    let h = Harness::new();
    h.register_ant("ant-1", &["SHELL"], 4);
    let request = h.submit(&shell_job("build")).await;
    h.queue.set_fail_publishes(true);
    h.stores.job_executions.set_fail_deletes(true);

    let outcome = h.state_machine(request.clone()).run().await?;
    assert_eq!(outcome, ScheduleOutcome::Reverted);
    let executions = h.stores.job_executions.find_by_request(request.id).await?;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].job_state, JobState::Cancelled);

    h.queue.set_fail_publishes(false);
    let outcome = h.state_machine(h.request(request.id).await).run().await?;
    assert!(matches!(outcome, ScheduleOutcome::Scheduled { .. }));
    assert_eq!(h.request(request.id).await.job_state, JobState::Ready);
    Ok(())
}

#[tokio::test]
async fn test_leftover_live_execution_does_not_block_pending_request() -> Result<()> {
    let h = Harness::new();
    h.register_ant("ant-1", &["SHELL"], 4);
    let request = h.submit(&shell_job("build")).await;
    // 进程在撤销执行记录前退出留下的记录
    let leftover = JobExecution::for_request(&request, Vec::new());
    h.stores.job_executions.create(&leftover).await?;

    let outcome = h.state_machine(request.clone()).run().await?;
    let ScheduleOutcome::Scheduled { job_execution_id } = outcome else {
        panic!("未能下发: {outcome:?}");
    };
    assert_ne!(job_execution_id, leftover.id);
    assert_eq!(
        h.stores.job_executions.get(&leftover.id).await?.job_state,
        JobState::Cancelled
    );
    assert_eq!(h.queue.published(LAUNCH_TOPIC).await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_overlapping_pass_is_busy() -> Result<()> {
    let jobs = JobsConfig {
        leader_election_enabled: false,
        ..JobsConfig::default()
    };
    let h = Harness::with_health_monitor(jobs, slow_database(Duration::from_millis(300)));

    let (first, second) = tokio::join!(h.scheduler.schedule_pass(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.scheduler.schedule_pass().await
    });

    assert_eq!(second?, PassResult::Busy);
    assert!(matches!(first, Err(SchedulerError::NoSchedulableJobs)));
    assert_eq!(h.scheduler.stats().no_jobs_tries, 3);
    Ok(())
}

#[tokio::test]
async fn test_hung_health_check_times_out_with_backoff() -> Result<()> {
    let jobs = JobsConfig {
        leader_election_enabled: false,
        health_check_timeout_seconds: 1,
        ..JobsConfig::default()
    };
    let h = Harness::with_health_monitor(jobs, slow_database(Duration::from_secs(30)));
    h.register_ant("ant-1", &["SHELL"], 4);
    let request = h.submit(&shell_job("build")).await;

    let result = tokio::time::timeout(Duration::from_secs(5), h.scheduler.schedule_pass()).await?;
    assert!(matches!(result, Err(SchedulerError::UnhealthyDependency(_))));
    assert_eq!(h.scheduler.stats().no_jobs_tries, 2);
    assert_eq!(h.request(request.id).await.job_state, JobState::Pending);

    assert_eq!(
        h.scheduler.schedule_pass().await?,
        PassResult::Backoff { remaining: 1 }
    );
    assert_eq!(
        h.scheduler.schedule_pass().await?,
        PassResult::Backoff { remaining: 0 }
    );
    Ok(())
}

#[tokio::test]
async fn test_pass_without_progress_backs_off_once() -> Result<()> {
    let h = Harness::new();
    h.register_ant("ant-1", &["SHELL"], 4);
    let request = h.submit(&shell_job("build")).await;
    h.queue.set_fail_publishes(true);

    assert_eq!(
        h.scheduler.schedule_pass().await?,
        PassResult::Completed {
            checked: 1,
            progressed: 0,
            scheduled: 0
        }
    );
    assert_eq!(h.scheduler.stats().no_jobs_tries, 1);
    assert_eq!(
        h.scheduler.schedule_pass().await?,
        PassResult::Backoff { remaining: 0 }
    );

    h.queue.set_fail_publishes(false);
    let result = h.scheduler.schedule_pass().await?;
    assert!(matches!(result, PassResult::Completed { scheduled: 1, .. }));
    assert_eq!(h.scheduler.stats().no_jobs_tries, 0);
    assert_eq!(h.request(request.id).await.job_state, JobState::Ready);
    Ok(())
}
