use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ant::AntReservation;
use super::job_request::{JobRequestInfo, JobState};

/// 请求被真正下发后创建的执行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: String,
    pub job_request_id: u64,
    pub job_type: String,
    pub job_version: String,
    pub user_id: String,
    pub organization_id: Option<String>,
    pub job_priority: i32,
    pub job_state: JobState,
    pub reservations: Vec<AntReservation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobExecution {
    pub fn for_request(request: &JobRequestInfo, reservations: Vec<AntReservation>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            job_request_id: request.id,
            job_type: request.job_type.clone(),
            job_version: request.job_version.clone(),
            user_id: request.user_id.clone(),
            organization_id: request.organization_id.clone(),
            job_priority: request.job_priority,
            job_state: JobState::Ready,
            reservations,
            created_at: now,
            updated_at: now,
        }
    }
}
