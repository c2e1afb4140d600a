use serde::{Deserialize, Serialize};

use scheduler_core::SchedulerError;

/// 记录在失败请求上的终态错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Validation,
    QuotaExceeded,
    FilteredJob,
    AntResourcesUnavailable,
    JobExecuteFailure,
}

impl ErrorCategory {
    pub fn error_code(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "ERR_VALIDATION",
            ErrorCategory::QuotaExceeded => "ERR_QUOTA_EXCEEDED",
            ErrorCategory::FilteredJob => "ERR_FILTERED_JOB",
            ErrorCategory::AntResourcesUnavailable => "ERR_ANT_RESOURCES",
            ErrorCategory::JobExecuteFailure => "ERR_JOB_EXECUTE",
        }
    }

    pub fn from_error(err: &SchedulerError) -> Option<Self> {
        match err {
            SchedulerError::Validation(_) | SchedulerError::InvalidCron { .. } => {
                Some(ErrorCategory::Validation)
            }
            SchedulerError::QuotaExceeded(_) => Some(ErrorCategory::QuotaExceeded),
            SchedulerError::FilteredJob(_) => Some(ErrorCategory::FilteredJob),
            SchedulerError::AntResourcesUnavailable(_) => {
                Some(ErrorCategory::AntResourcesUnavailable)
            }
            SchedulerError::JobExecuteFailure(_) => Some(ErrorCategory::JobExecuteFailure),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.error_code())
    }
}
