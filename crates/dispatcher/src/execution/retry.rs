use std::time::Duration;

use scheduler_core::config::JobsConfig;

/// 资源不足时每次推迟的基础秒数
const DELAY_STEP_SECS: u64 = 5;
/// 每失败这么多次降一级优先级
const PRIORITY_DECAY_EVERY: u32 = 5;
/// 优先级只在高于该值时衰减
const PRIORITY_DECAY_FLOOR: i32 = 5;

/// 资源不足时的重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_wait: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            max_attempts: config.max_schedule_attempts,
            max_wait: Duration::from_secs(config.not_ready_max_wait_seconds),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPlan {
    /// 推迟 `delay` 后再调度
    Retry {
        attempts: u32,
        delay: Duration,
        decrement_priority: i32,
    },
    /// 尝试次数用尽，请求应失败
    Exhausted { attempts: u32 },
}

/// 根据已有的尝试次数与当前优先级计算下一步
pub fn plan_retry(attempts: u32, priority: i32, policy: &RetryPolicy) -> RetryPlan {
    let next = attempts.saturating_add(1);
    if next > policy.max_attempts {
        return RetryPlan::Exhausted { attempts };
    }

    let delay = Duration::from_secs(u64::from(next) * DELAY_STEP_SECS).min(policy.max_wait);
    let decrement_priority =
        if next % PRIORITY_DECAY_EVERY == 0 && priority > PRIORITY_DECAY_FLOOR {
            1
        } else {
            0
        };
    RetryPlan::Retry {
        attempts: next,
        delay,
        decrement_priority,
    }
}
