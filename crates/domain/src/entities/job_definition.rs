use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scheduler_core::{SchedulerError, SchedulerResult};

/// 过滤掉cron作业后是否删除请求的作业变量
pub const DELETE_FILTERED_CRON_JOBS: &str = "DeleteFilteredCronJobs";

/// 单个任务的放置要求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_type: String,
    /// 执行方式，Ant必须声明支持
    pub method: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TaskDefinition {
    pub fn new(task_type: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            method: method.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    /// 任务自身的标签与作业级标签的并集，按字典序排列
    pub fn required_tags(&self, job_tags: &[String]) -> Vec<String> {
        let mut tags: Vec<String> = self
            .tags
            .iter()
            .chain(job_tags.iter())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        tags.sort();
        tags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Equals,
    NotEquals,
    In,
    NotIn,
}

/// 过滤规则：命中任意一条规则的请求不会被调度
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub field: String,
    pub op: FilterOp,
    pub values: Vec<String>,
}

impl FilterRule {
    pub fn new(field: impl Into<String>, op: FilterOp, values: &[&str]) -> Self {
        Self {
            field: field.into(),
            op,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// 字段缺失时只有否定类规则会命中
    pub fn matches(&self, context: &HashMap<String, String>) -> bool {
        let value = context.get(&self.field);
        match self.op {
            FilterOp::Equals | FilterOp::In => {
                value.is_some_and(|v| self.values.iter().any(|candidate| candidate == v))
            }
            FilterOp::NotEquals | FilterOp::NotIn => {
                value.map_or(true, |v| self.values.iter().all(|candidate| candidate != v))
            }
        }
    }
}

/// 作业定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    pub job_type: String,
    #[serde(default)]
    pub sem_version: String,
    pub user_id: String,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub cron_trigger: Option<String>,
    /// 0表示不限制
    #[serde(default)]
    pub max_concurrency: u32,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub filters: Vec<FilterRule>,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
}

fn default_priority() -> i32 {
    5
}

/// 标准5段cron表达式补齐秒字段
fn parse_cron(expr: &str) -> SchedulerResult<cron::Schedule> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
        expr: expr.to_string(),
        message: e.to_string(),
    })
}

/// 下一次cron触发时间及对应的去重键
pub fn cron_schedule_time_and_user_key(
    owner: &str,
    job_type: &str,
    cron_trigger: &str,
    now: DateTime<Utc>,
) -> SchedulerResult<Option<(DateTime<Utc>, String)>> {
    if cron_trigger.is_empty() {
        return Ok(None);
    }
    let schedule = parse_cron(cron_trigger)?;
    Ok(schedule.after(&now).next().map(|next| {
        let key = format!("{owner}-{job_type}-{}", next.to_rfc3339());
        (next, key)
    }))
}

impl JobDefinition {
    pub fn new(id: impl Into<String>, job_type: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            job_type: job_type.into(),
            sem_version: String::new(),
            user_id: user_id.into(),
            organization_id: None,
            cron_trigger: None,
            max_concurrency: 0,
            priority: default_priority(),
            disabled: false,
            paused: false,
            tags: Vec::new(),
            tasks: Vec::new(),
            filters: Vec::new(),
            variables: HashMap::new(),
        }
    }

    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn owner(&self) -> &str {
        match &self.organization_id {
            Some(org) if !org.is_empty() => org,
            _ => &self.user_id,
        }
    }

    /// 结构校验，失败时返回 `Validation`
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.job_type.trim().is_empty() {
            return Err(SchedulerError::Validation("作业类型不能为空".to_string()));
        }
        if self.user_id.is_empty() {
            return Err(SchedulerError::Validation(format!(
                "作业 {} 缺少用户",
                self.job_type
            )));
        }
        if self.tasks.is_empty() {
            return Err(SchedulerError::Validation(format!(
                "作业 {} 没有定义任务",
                self.job_type
            )));
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.task_type.is_empty() {
                return Err(SchedulerError::Validation(format!(
                    "作业 {} 包含未命名的任务",
                    self.job_type
                )));
            }
            if task.method.is_empty() {
                return Err(SchedulerError::Validation(format!(
                    "任务 {} 未指定执行方式",
                    task.task_type
                )));
            }
            if !seen.insert(task.task_type.as_str()) {
                return Err(SchedulerError::Validation(format!(
                    "任务类型重复: {}",
                    task.task_type
                )));
            }
        }

        if let Some(cron) = &self.cron_trigger {
            parse_cron(cron).map_err(|e| SchedulerError::Validation(e.to_string()))?;
        }
        Ok(())
    }

    pub fn cron_schedule_time_and_user_key(
        &self,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<(DateTime<Utc>, String)>> {
        if self.disabled {
            return Ok(None);
        }
        match &self.cron_trigger {
            Some(cron) => cron_schedule_time_and_user_key(self.owner(), &self.job_type, cron, now),
            None => Ok(None),
        }
    }

    pub fn delete_filtered_cron_jobs(&self) -> bool {
        self.cron_trigger.is_some()
            && self.variables.get(DELETE_FILTERED_CRON_JOBS) == Some(&serde_json::Value::Bool(true))
    }

    /// 作业需要的全部执行方式
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.tasks.iter().map(|t| t.method.clone()).collect();
        methods.sort();
        methods.dedup();
        methods
    }

    /// 返回命中的过滤规则
    pub fn filtered(&self, context: &HashMap<String, String>) -> Option<&FilterRule> {
        self.filters.iter().find(|rule| rule.matches(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn definition() -> JobDefinition {
        JobDefinition::new("def-1", "nightly-build", "alice")
            .with_task(TaskDefinition::new("checkout", "KUBERNETES"))
            .with_task(TaskDefinition::new("compile", "KUBERNETES").with_tags(&["gpu"]))
    }

    #[test]
    fn test_validate_rejects_duplicate_tasks() {
        let def = definition().with_task(TaskDefinition::new("compile", "SHELL"));
        let err = def.validate().unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
    }

    #[test]
    fn test_validate_rejects_bad_cron() {
        let mut def = definition();
        def.cron_trigger = Some("every tuesday".to_string());
        assert!(def.validate().is_err());

        def.cron_trigger = Some("0 0 * * *".to_string());
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_cron_schedule_time_and_user_key() {
        let mut def = definition();
        def.cron_trigger = Some("0 3 * * *".to_string());
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();

        let (next, key) = def.cron_schedule_time_and_user_key(now).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 2, 3, 0, 0).unwrap());
        assert_eq!(key, format!("alice-nightly-build-{}", next.to_rfc3339()));

        def.disabled = true;
        assert!(def.cron_schedule_time_and_user_key(now).unwrap().is_none());
    }

    #[test]
    fn test_required_tags_merge_job_tags() {
        let task = TaskDefinition::new("compile", "SHELL").with_tags(&["gpu", "linux"]);
        let tags = task.required_tags(&["linux".to_string(), "large".to_string()]);
        assert_eq!(tags, vec!["gpu", "large", "linux"]);
    }

    #[test]
    fn test_filter_rules() {
        let mut def = definition();
        def.filters
            .push(FilterRule::new("Weekday", FilterOp::In, &["Saturday", "Sunday"]));

        let mut context = HashMap::new();
        context.insert("Weekday".to_string(), "Sunday".to_string());
        assert!(def.filtered(&context).is_some());

        context.insert("Weekday".to_string(), "Monday".to_string());
        assert!(def.filtered(&context).is_none());

        let rule = FilterRule::new("Branch", FilterOp::NotEquals, &["main"]);
        assert!(rule.matches(&HashMap::new()));
    }

    #[test]
    fn test_delete_filtered_cron_jobs_requires_cron() {
        let mut def = definition();
        def.variables
            .insert(DELETE_FILTERED_CRON_JOBS.to_string(), serde_json::Value::Bool(true));
        assert!(!def.delete_filtered_cron_jobs());

        def.cron_trigger = Some("0 * * * *".to_string());
        assert!(def.delete_filtered_cron_jobs());
    }
}
