use chrono::Utc;
use tracing::{debug, info, info_span, warn, Instrument};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::entities::{JobRequestInfo, JobState};

use super::JobScheduler;

impl JobScheduler {
    /// 把超时滞留在READY/STARTED/EXECUTING的请求改回PENDING
    ///
    /// 同时释放它们的资源预留，并把残留的执行记录置为CANCELLED。
    pub async fn requeue_orphans(&self) -> SchedulerResult<Vec<u64>> {
        let ctx = self.context().clone();
        async move {
            let repos = &ctx.repositories;
            let ids = repos
                .job_requests
                .requeue_orphan_job_requests(ctx.jobs.orphan_requests_timeout())
                .await?;
            if ids.is_empty() {
                debug!("没有孤儿请求");
                return Ok(ids);
            }

            for &id in &ids {
                let released = ctx.resources.release_job_resources(id);
                match repos.job_executions.find_by_request(id).await {
                    Ok(executions) => {
                        for execution in executions.iter().filter(|e| !e.job_state.is_terminal()) {
                            if let Err(e) = repos
                                .job_executions
                                .update_state(&execution.id, JobState::Cancelled)
                                .await
                            {
                                warn!(request_id = id, job_execution_id = %execution.id, "取消孤儿执行记录失败: {e}");
                            }
                        }
                    }
                    Err(e) => warn!(request_id = id, "查询孤儿请求的执行记录失败: {e}"),
                }
                if let Ok(request) = repos.job_requests.get(id).await {
                    ctx.stats.pending(&request, true);
                }
                debug!(request_id = id, released, "孤儿请求已改回PENDING");
            }

            ctx.metrics.record_orphans_requeued(ids.len() as u64);
            info!(count = ids.len(), "已回收孤儿请求");
            Ok(ids)
        }
        .instrument(info_span!("orphan_sweep"))
        .await
    }

    /// 为缺少待执行请求的cron作业补建下一次请求，返回新建的数量
    pub async fn schedule_missing_cron_jobs(&self) -> SchedulerResult<usize> {
        let ctx = self.context().clone();
        async move {
            let repos = &ctx.repositories;
            let triggers = repos.job_definitions.get_cron_triggered_job_types().await?;
            let chunk_size = ctx.jobs.missing_cron_chunk_size.max(1);
            let mut created = 0;

            for chunk in triggers.chunks(chunk_size) {
                let missing = repos
                    .job_requests
                    .find_missing_cron_scheduled_jobs_by_type(chunk)
                    .await?;
                for trigger in missing {
                    let definition = match repos
                        .job_definitions
                        .get_by_type(
                            &trigger.user_id,
                            trigger.organization_id.as_deref(),
                            &trigger.job_type,
                        )
                        .await
                    {
                        Ok(definition) => definition,
                        Err(e) => {
                            warn!(job_type = %trigger.job_type, "加载cron作业定义失败: {e}");
                            continue;
                        }
                    };
                    if definition.disabled || definition.paused {
                        continue;
                    }

                    let request = match JobRequestInfo::from_definition(&definition, Utc::now()) {
                        Ok(request) => request,
                        Err(e) => {
                            warn!(job_type = %trigger.job_type, "生成cron请求失败: {e}");
                            continue;
                        }
                    };
                    match repos.job_requests.save(&request).await {
                        Ok(saved) => {
                            created += 1;
                            ctx.stats.pending(&saved, false);
                            info!(
                                request_id = saved.id,
                                job_type = %saved.job_type,
                                scheduled_at = %saved.scheduled_at,
                                "已补建cron请求"
                            );
                        }
                        Err(SchedulerError::StateConflict(msg)) => {
                            debug!(job_type = %trigger.job_type, "cron请求已存在: {msg}");
                        }
                        Err(e) => warn!(job_type = %trigger.job_type, "保存cron请求失败: {e}"),
                    }
                }
            }

            if created > 0 {
                ctx.metrics.record_missing_cron_jobs(created as u64);
            }
            Ok(created)
        }
        .instrument(info_span!("missing_cron_sweep"))
        .await
    }
}
