use std::collections::HashMap;

use chrono::{DateTime, Datelike, Timelike, Utc};

use scheduler_domain::entities::{JobDefinition, JobRequestInfo};

/// 过滤规则可以引用的字段
///
/// 内置字段优先于同名的请求参数与作业变量。
pub fn filter_context(
    request: &JobRequestInfo,
    definition: &JobDefinition,
    now: DateTime<Utc>,
) -> HashMap<String, String> {
    let mut context: HashMap<String, String> = HashMap::new();
    for (name, value) in &definition.variables {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        context.insert(name.clone(), value);
    }
    for (name, value) in &request.params {
        context.insert(name.clone(), value.clone());
    }

    context.insert("JobType".to_string(), request.job_type.clone());
    context.insert("UserID".to_string(), request.user_id.clone());
    context.insert(
        "OrganizationID".to_string(),
        request.organization_id.clone().unwrap_or_default(),
    );
    context.insert("Weekday".to_string(), format!("{:?}", now.weekday()));
    context.insert("Hour".to_string(), now.hour().to_string());
    context.insert("Priority".to_string(), request.job_priority.to_string());
    context.insert("CronTriggered".to_string(), request.cron_triggered.to_string());
    context
}
