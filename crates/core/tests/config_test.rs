use std::io::Write;

use scheduler_core::config::*;
use tempfile::NamedTempFile;

#[test]
fn test_default_config() {
    let config = AppConfig::default();
    assert!(config.validate().is_ok());

    assert!(!config.server_id.is_empty());
    assert_eq!(config.jobs.max_schedule_attempts, 10000);
    assert_eq!(config.jobs.leader_lease_ttl_seconds, 45);
    assert_eq!(config.database.kind, DatabaseKind::InMemory);
    assert_eq!(config.message_queue.leader_topic, "job-scheduler-leader");
}

#[test]
fn test_config_from_toml() {
    let toml_content = r#"
server_id = "scheduler-7"

[jobs]
not_ready_max_wait_seconds = 60
max_schedule_attempts = 20
pending_batch_size = 50

[database]
kind = "postgres"
url = "postgresql://db:5432/scheduler"
max_connections = 15

[message_queue]
kind = "rabbitmq"
job_launch_topic = "launch"

[observability]
log_level = "debug"
log_format = "json"
"#;

    let config = AppConfig::from_toml(toml_content).unwrap();
    assert_eq!(config.server_id, "scheduler-7");
    assert_eq!(config.jobs.not_ready_max_wait_seconds, 60);
    assert_eq!(config.jobs.max_schedule_attempts, 20);
    assert_eq!(config.jobs.pending_batch_size, 50);
    // 未给出的字段保持默认值
    assert_eq!(config.jobs.orphan_requests_timeout_seconds, 60);
    assert_eq!(config.database.kind, DatabaseKind::Postgres);
    assert_eq!(config.database.max_connections, 15);
    assert_eq!(config.message_queue.kind, MessageQueueKind::Rabbitmq);
    assert_eq!(config.message_queue.job_launch_topic, "launch");
    assert_eq!(config.observability.log_format, LogFormat::Json);
}

#[test]
fn test_config_validation_failures() {
    let zero_attempts = "[jobs]\nmax_schedule_attempts = 0\n";
    assert!(AppConfig::from_toml(zero_attempts).is_err());

    let short_lease = "[jobs]\nleader_lease_ttl_seconds = 10\njob_scheduler_leader_interval_seconds = 15\n";
    assert!(AppConfig::from_toml(short_lease).is_err());

    // 关闭选举时不校验租约时长
    let no_election = "[jobs]\nleader_election_enabled = false\nleader_lease_ttl_seconds = 10\n";
    assert!(AppConfig::from_toml(no_election).is_ok());

    let bad_url = "[database]\nkind = \"postgres\"\nurl = \"mysql://localhost/scheduler\"\n";
    assert!(AppConfig::from_toml(bad_url).is_err());

    let bad_level = "[observability]\nlog_level = \"verbose\"\n";
    assert!(AppConfig::from_toml(bad_level).is_err());

    let empty_topic = "[message_queue]\nleader_topic = \"\"\n";
    assert!(AppConfig::from_toml(empty_topic).is_err());
}

#[test]
fn test_load_from_file_and_round_trip() {
    let mut file = NamedTempFile::with_suffix(".toml").unwrap();
    writeln!(file, "server_id = \"from-file\"\n\n[jobs]\nmax_no_jobs_tries = 4").unwrap();

    let config = AppConfig::load(file.path().to_str()).unwrap();
    assert_eq!(config.server_id, "from-file");
    assert_eq!(config.jobs.max_no_jobs_tries, 4);

    let serialized = config.to_toml().unwrap();
    let reparsed = AppConfig::from_toml(&serialized).unwrap();
    assert_eq!(reparsed.jobs.max_no_jobs_tries, 4);
}

#[test]
fn test_load_missing_file_fails() {
    assert!(AppConfig::load(Some("/nonexistent/scheduler.toml")).is_err());
}
