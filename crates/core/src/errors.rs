use thiserror::Error;

/// 调度器错误类型定义
///
/// 前五个调度错误(`Validation` 到 `JobExecuteFailure`)是终态错误，会把请求置为 FAILED；
/// 其余调度相关错误都是瞬时错误，请求保持 PENDING，只做日志与计数。
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("任务请求未找到: {id}")]
    JobRequestNotFound { id: u64 },

    #[error("任务定义未找到: {id}")]
    JobDefinitionNotFound { id: String },

    #[error("任务执行记录未找到: {id}")]
    JobExecutionNotFound { id: String },

    #[error("用户未找到: {id}")]
    UserNotFound { id: String },

    #[error("组织未找到: {id}")]
    OrganizationNotFound { id: String },

    #[error("Ant未找到: {id}")]
    AntNotFound { id: String },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("校验失败: {0}")]
    Validation(String),

    #[error("超出订阅配额: {0}")]
    QuotaExceeded(String),

    #[error("任务被过滤: {0}")]
    FilteredJob(String),

    #[error("Ant资源不可用: {0}")]
    AntResourcesUnavailable(String),

    #[error("创建任务执行失败: {0}")]
    JobExecuteFailure(String),

    #[error("没有待调度的任务")]
    NoSchedulableJobs,

    #[error("依赖服务不健康: {0}")]
    UnhealthyDependency(String),

    #[error("消息发布失败: {0}")]
    PublishFailure(String),

    #[error("批量获取待调度任务失败: {0}")]
    BatchFetchFailure(String),

    #[error("稍后重试: {0}")]
    WillRetry(String),

    #[error("任务请求 {id} 已在调度中")]
    AlreadyScheduled { id: u64 },

    #[error("状态冲突: {0}")]
    StateConflict(String),

    #[error("调度器正在关闭")]
    ShuttingDown,

    #[error("失去领导权: {0}")]
    LeadershipLost(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("消息队列错误: {0}")]
    MessageQueue(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// 瞬时错误不会改变请求的终态，只影响本轮调度
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SchedulerError::NoSchedulableJobs
                | SchedulerError::UnhealthyDependency(_)
                | SchedulerError::PublishFailure(_)
                | SchedulerError::BatchFetchFailure(_)
                | SchedulerError::WillRetry(_)
                | SchedulerError::AlreadyScheduled { .. }
                | SchedulerError::Timeout(_)
                | SchedulerError::ShuttingDown
        )
    }

    /// 是否为需要记录到请求上的终态调度错误
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Validation(_)
                | SchedulerError::QuotaExceeded(_)
                | SchedulerError::FilteredJob(_)
                | SchedulerError::AntResourcesUnavailable(_)
                | SchedulerError::JobExecuteFailure(_)
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, SchedulerError>;
