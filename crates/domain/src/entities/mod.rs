pub mod account;
pub mod ant;
pub mod container;
pub mod error_category;
pub mod job_definition;
pub mod job_execution;
pub mod job_request;

pub use account::{Organization, ResourceUsage, Subscription, User};
pub use ant::{AntAllocation, AntRegistration, AntReservation};
pub use container::{ContainerLifecycleEvent, ContainerState, LABEL_JOB_REQUEST_ID};
pub use error_category::ErrorCategory;
pub use job_definition::{
    cron_schedule_time_and_user_key, FilterOp, FilterRule, JobDefinition, TaskDefinition,
    DELETE_FILTERED_CRON_JOBS,
};
pub use job_execution::JobExecution;
pub use job_request::{user_job_type_key, JobRequestInfo, JobState, JobTypeCronTrigger};
