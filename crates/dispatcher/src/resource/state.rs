use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::entities::{
    AntRegistration, AntReservation, ContainerLifecycleEvent, JobDefinition,
};

/// 容器清单的排序方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerSort {
    /// 启动时间倒序
    #[default]
    Recent,
    Key,
    /// 运行时长倒序
    Elapsed,
    Name,
}

impl FromStr for ContainerSort {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "started_at" | "recent" => Ok(ContainerSort::Recent),
            "key" => Ok(ContainerSort::Key),
            "elapsed" => Ok(ContainerSort::Elapsed),
            "name" | "container_name" => Ok(ContainerSort::Name),
            other => Err(SchedulerError::Validation(format!("未知的排序字段: {other}"))),
        }
    }
}

impl fmt::Display for ContainerSort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerSort::Recent => "started_at",
            ContainerSort::Key => "key",
            ContainerSort::Elapsed => "elapsed",
            ContainerSort::Name => "name",
        };
        f.write_str(name)
    }
}

/// (请求id, 任务类型)
type AllocationKey = (u64, String);

/// Ant注册、预留与容器的内存索引
///
/// 不做任何加锁，由 `AntResourceManager` 放在读写锁之后使用。
#[derive(Debug)]
pub(crate) struct ResourceState {
    alive_timeout: Duration,
    registrations: HashMap<String, AntRegistration>,
    ants_by_method: HashMap<String, BTreeSet<String>>,
    ants_by_tag: HashMap<String, BTreeSet<String>>,
    reservations_by_request: HashMap<u64, BTreeMap<String, AntReservation>>,
    /// Ant -> 已分配的任务及分配时间（包括本地预留与心跳上报的分配）
    allocations_by_ant: HashMap<String, HashMap<AllocationKey, DateTime<Utc>>>,
    containers: HashMap<String, ContainerLifecycleEvent>,
    container_keys_by_request: HashMap<u64, BTreeSet<String>>,
    container_log: VecDeque<ContainerLifecycleEvent>,
    container_log_capacity: usize,
}

impl ResourceState {
    pub(crate) fn new(alive_timeout: Duration, container_log_capacity: usize) -> Self {
        Self {
            alive_timeout,
            registrations: HashMap::new(),
            ants_by_method: HashMap::new(),
            ants_by_tag: HashMap::new(),
            reservations_by_request: HashMap::new(),
            allocations_by_ant: HashMap::new(),
            containers: HashMap::new(),
            container_keys_by_request: HashMap::new(),
            container_log: VecDeque::new(),
            container_log_capacity,
        }
    }

    // ---- registrations ----

    /// 新增或刷新注册，返回是否是新Ant
    pub(crate) fn add_registration(
        &mut self,
        mut registration: AntRegistration,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        registration.validate()?;
        registration.updated_at = now;

        let is_new = self.remove_indexes(&registration.ant_id).is_none();
        for method in &registration.methods {
            self.ants_by_method
                .entry(method.clone())
                .or_default()
                .insert(registration.ant_id.clone());
        }
        for tag in &registration.tags {
            self.ants_by_tag
                .entry(tag.clone())
                .or_default()
                .insert(registration.ant_id.clone());
        }

        let allocations = self
            .allocations_by_ant
            .entry(registration.ant_id.clone())
            .or_default();
        for allocation in &registration.allocations {
            allocations
                .entry((allocation.job_request_id, allocation.task_type.clone()))
                .or_insert(allocation.allocated_at);
        }

        self.registrations
            .insert(registration.ant_id.clone(), registration);
        Ok(is_new)
    }

    fn remove_indexes(&mut self, ant_id: &str) -> Option<AntRegistration> {
        let old = self.registrations.remove(ant_id)?;
        for method in &old.methods {
            if let Some(ants) = self.ants_by_method.get_mut(method) {
                ants.remove(ant_id);
                if ants.is_empty() {
                    self.ants_by_method.remove(method);
                }
            }
        }
        for tag in &old.tags {
            if let Some(ants) = self.ants_by_tag.get_mut(tag) {
                ants.remove(ant_id);
                if ants.is_empty() {
                    self.ants_by_tag.remove(tag);
                }
            }
        }
        Some(old)
    }

    /// 删除注册以及分配到该Ant上的全部预留
    pub(crate) fn remove_registration(&mut self, ant_id: &str) -> Option<AntRegistration> {
        let removed = self.remove_indexes(ant_id);
        self.allocations_by_ant.remove(ant_id);
        for reservations in self.reservations_by_request.values_mut() {
            reservations.retain(|_, r| r.ant_id != ant_id);
        }
        self.reservations_by_request.retain(|_, r| !r.is_empty());
        removed
    }

    pub(crate) fn registrations(&self) -> Vec<AntRegistration> {
        let mut registrations: Vec<AntRegistration> = self
            .registrations
            .values()
            .map(|r| self.with_load(r))
            .collect();
        registrations.sort_by(|a, b| a.ant_id.cmp(&b.ant_id));
        registrations
    }

    pub(crate) fn registration(&self, ant_id: &str) -> Option<AntRegistration> {
        self.registrations.get(ant_id).map(|r| self.with_load(r))
    }

    fn with_load(&self, registration: &AntRegistration) -> AntRegistration {
        let mut registration = registration.clone();
        registration.current_load = self.load(&registration.ant_id) as i32;
        registration
    }

    fn load(&self, ant_id: &str) -> usize {
        self.allocations_by_ant.get(ant_id).map_or(0, HashMap::len)
    }

    fn is_alive(&self, ant_id: &str, now: DateTime<Utc>) -> bool {
        self.registrations
            .get(ant_id)
            .is_some_and(|r| r.is_alive(self.alive_timeout, now))
    }

    fn has_capacity(&self, ant_id: &str, extra: usize) -> bool {
        self.registrations
            .get(ant_id)
            .is_some_and(|r| self.load(ant_id) + extra < r.max_capacity.max(0) as usize)
    }

    // ---- matching ----

    /// 每种执行方式至少有一个Ant，且每个标签至少有一个仍有余量的存活Ant
    pub(crate) fn has_ants_for_job_tags(
        &self,
        methods: &[String],
        tags: &[String],
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        if methods.is_empty() {
            return Err(SchedulerError::Validation(
                "作业没有指定任何执行方式".to_string(),
            ));
        }
        for method in methods {
            let alive = self
                .ants_by_method
                .get(method)
                .map_or(0, |ants| ants.iter().filter(|id| self.is_alive(id, now)).count());
            if alive == 0 {
                return Err(SchedulerError::AntResourcesUnavailable(format!(
                    "没有支持执行方式 {method} 的Ant (已注册执行方式 {} 种)",
                    self.ants_by_method.len()
                )));
            }
        }
        for tag in tags {
            let ants = self.ants_by_tag.get(tag).cloned().unwrap_or_default();
            if ants.is_empty() {
                return Err(SchedulerError::AntResourcesUnavailable(format!(
                    "没有带标签 {tag} 的Ant"
                )));
            }
            let matched = ants
                .iter()
                .any(|id| self.is_alive(id, now) && self.has_capacity(id, 0));
            if !matched {
                return Err(SchedulerError::AntResourcesUnavailable(format!(
                    "带标签 {tag} 的 {} 个Ant都已满载或失联",
                    ants.len()
                )));
            }
        }
        Ok(())
    }

    /// 满足执行方式与全部标签、心跳未过期且仍有余量的Ant，按负载、id排序
    fn candidates(
        &self,
        method: &str,
        tags: &[String],
        planned: &HashMap<String, usize>,
        now: DateTime<Utc>,
    ) -> Vec<(usize, String)> {
        let Some(ants) = self.ants_by_method.get(method) else {
            return Vec::new();
        };
        let mut candidates: Vec<(usize, String)> = ants
            .iter()
            .filter_map(|id| self.registrations.get(id))
            .filter(|r| r.supports(method, tags, self.alive_timeout, now))
            .filter_map(|r| {
                let extra = planned.get(&r.ant_id).copied().unwrap_or(0);
                self.has_capacity(&r.ant_id, extra)
                    .then(|| (self.load(&r.ant_id) + extra, r.ant_id.clone()))
            })
            .collect();
        candidates.sort();
        candidates
    }

    /// 为作业的每个任务挑选Ant，不修改状态
    fn plan(
        &self,
        request_id: u64,
        definition: &JobDefinition,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<AntReservation>> {
        let mut planned: HashMap<String, usize> = HashMap::new();
        let mut reservations = Vec::with_capacity(definition.tasks.len());
        for task in &definition.tasks {
            if task.method.is_empty() {
                return Err(SchedulerError::Validation(format!(
                    "任务 {} 未指定执行方式",
                    task.task_type
                )));
            }
            let tags = task.required_tags(&definition.tags);
            let Some((load, ant_id)) = self
                .candidates(&task.method, &tags, &planned, now)
                .into_iter()
                .next()
            else {
                return Err(SchedulerError::AntResourcesUnavailable(format!(
                    "任务 {} 没有可用的Ant (执行方式={}, 标签={:?})",
                    task.task_type, task.method, tags
                )));
            };
            *planned.entry(ant_id.clone()).or_default() += 1;
            let ant_topic = self
                .registrations
                .get(&ant_id)
                .map(|r| r.ant_topic.clone())
                .unwrap_or_default();
            reservations.push(AntReservation {
                job_request_id: request_id,
                task_type: task.task_type.clone(),
                ant_id,
                ant_topic,
                method: task.method.clone(),
                current_load: load as i32,
                allocated_at: now,
            });
        }
        Ok(reservations)
    }

    pub(crate) fn check_job_resources(
        &self,
        definition: &JobDefinition,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<AntReservation>> {
        self.plan(0, definition, now)
    }

    /// 能承接作业全部任务的最少Ant数
    pub(crate) fn available_ants_for_job(&self, definition: &JobDefinition, now: DateTime<Utc>) -> usize {
        let empty = HashMap::new();
        definition
            .tasks
            .iter()
            .map(|task| {
                let tags = task.required_tags(&definition.tags);
                self.candidates(&task.method, &tags, &empty, now).len()
            })
            .min()
            .unwrap_or(0)
    }

    /// 全有或全无地为请求预留资源
    pub(crate) fn reserve_job_resources(
        &mut self,
        request_id: u64,
        definition: &JobDefinition,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<AntReservation>> {
        if self
            .reservations_by_request
            .get(&request_id)
            .is_some_and(|r| !r.is_empty())
        {
            return Err(SchedulerError::AlreadyScheduled { id: request_id });
        }

        let reservations = self.plan(request_id, definition, now)?;
        let by_task = self.reservations_by_request.entry(request_id).or_default();
        for reservation in &reservations {
            by_task.insert(reservation.task_type.clone(), reservation.clone());
            self.allocations_by_ant
                .entry(reservation.ant_id.clone())
                .or_default()
                .insert((request_id, reservation.task_type.clone()), now);
        }
        Ok(reservations)
    }

    pub(crate) fn reservations_for(&self, request_id: u64) -> Vec<AntReservation> {
        self.reservations_by_request
            .get(&request_id)
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn all_reservations(&self) -> Vec<AntReservation> {
        let mut all: Vec<AntReservation> = self
            .reservations_by_request
            .values()
            .flat_map(|r| r.values().cloned())
            .collect();
        all.sort_by(|a, b| {
            a.job_request_id
                .cmp(&b.job_request_id)
                .then_with(|| a.task_type.cmp(&b.task_type))
        });
        all
    }

    /// 释放单个任务的预留
    pub(crate) fn release(&mut self, reservation: &AntReservation) -> SchedulerResult<()> {
        let key = (reservation.job_request_id, reservation.task_type.clone());
        if let Some(allocations) = self.allocations_by_ant.get_mut(&reservation.ant_id) {
            allocations.remove(&key);
        }
        if let Some(by_task) = self.reservations_by_request.get_mut(&reservation.job_request_id) {
            by_task.remove(&reservation.task_type);
            if by_task.is_empty() {
                self.reservations_by_request
                    .remove(&reservation.job_request_id);
            }
        }
        if !self.registrations.contains_key(&reservation.ant_id) {
            return Err(SchedulerError::AntNotFound {
                id: reservation.ant_id.clone(),
            });
        }
        Ok(())
    }

    /// 释放请求的全部预留、分配与容器索引，返回释放的分配数
    pub(crate) fn release_job(&mut self, request_id: u64) -> usize {
        self.reservations_by_request.remove(&request_id);
        let mut released = 0;
        for allocations in self.allocations_by_ant.values_mut() {
            let before = allocations.len();
            allocations.retain(|(id, _), _| *id != request_id);
            released += before - allocations.len();
        }
        if let Some(keys) = self.container_keys_by_request.remove(&request_id) {
            for key in keys {
                self.containers.remove(&key);
            }
        }
        released
    }

    // ---- reapers ----

    /// 删除心跳过期的Ant，返回被删除的id
    pub(crate) fn reap_stale_registrations(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let stale: Vec<String> = self
            .registrations
            .values()
            .filter(|r| !r.is_alive(self.alive_timeout, now))
            .map(|r| r.ant_id.clone())
            .collect();
        for ant_id in &stale {
            self.remove_registration(ant_id);
        }
        stale
    }

    /// 删除分配时间早于 `timeout` 的分配与预留
    pub(crate) fn reap_stale_allocations(&mut self, timeout: Duration, now: DateTime<Utc>) -> usize {
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return 0;
        };
        let cutoff = now - timeout;
        let mut reaped = 0;
        for allocations in self.allocations_by_ant.values_mut() {
            let before = allocations.len();
            allocations.retain(|_, allocated_at| *allocated_at >= cutoff);
            reaped += before - allocations.len();
        }
        for by_task in self.reservations_by_request.values_mut() {
            by_task.retain(|_, r| r.allocated_at >= cutoff);
        }
        self.reservations_by_request.retain(|_, r| !r.is_empty());
        reaped
    }

    // ---- containers ----

    pub(crate) fn update_container(&mut self, event: ContainerLifecycleEvent) {
        let key = event.key();
        let request_id = event.job_request_id();
        if event.container_state.is_done() {
            self.containers.remove(&key);
            if let Some(keys) = request_id.and_then(|id| self.container_keys_by_request.get_mut(&id)) {
                keys.remove(&key);
            }
        } else {
            self.containers.insert(key.clone(), event.clone());
            if let Some(id) = request_id {
                self.container_keys_by_request
                    .entry(id)
                    .or_default()
                    .insert(key);
            }
        }
        self.container_keys_by_request.retain(|_, keys| !keys.is_empty());

        if self.container_log_capacity > 0 {
            if self.container_log.len() >= self.container_log_capacity {
                self.container_log.pop_front();
            }
            self.container_log.push_back(event);
        }
    }

    pub(crate) fn containers(&self, sort: ContainerSort, now: DateTime<Utc>) -> Vec<ContainerLifecycleEvent> {
        let mut all: Vec<ContainerLifecycleEvent> = self.containers.values().cloned().collect();
        match sort {
            ContainerSort::Recent => all.sort_by(|a, b| {
                b.started_at
                    .cmp(&a.started_at)
                    .then_with(|| a.key().cmp(&b.key()))
            }),
            ContainerSort::Key => all.sort_by_key(|e| e.key()),
            ContainerSort::Elapsed => all.sort_by(|a, b| {
                b.elapsed(now)
                    .cmp(&a.elapsed(now))
                    .then_with(|| a.key().cmp(&b.key()))
            }),
            ContainerSort::Name => all.sort_by(|a, b| {
                a.container_name
                    .cmp(&b.container_name)
                    .then_with(|| a.key().cmp(&b.key()))
            }),
        }
        all
    }

    pub(crate) fn count_containers(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for event in self.containers.values() {
            *counts.entry(event.method.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// 最近的容器事件，新的在前
    pub(crate) fn recent_container_events(&self, limit: usize) -> Vec<ContainerLifecycleEvent> {
        self.container_log.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_domain::entities::{AntAllocation, ContainerState, TaskDefinition, LABEL_JOB_REQUEST_ID};

    const ALIVE: Duration = Duration::from_secs(15);

    fn definition() -> JobDefinition {
        JobDefinition::new("def-1", "build", "alice")
            .with_task(TaskDefinition::new("compile", "SHELL"))
            .with_task(TaskDefinition::new("package", "SHELL"))
    }

    fn state_with(ants: &[(&str, i32)]) -> (ResourceState, DateTime<Utc>) {
        let now = Utc::now();
        let mut state = ResourceState::new(ALIVE, 10);
        for (id, capacity) in ants {
            state
                .add_registration(AntRegistration::new(*id, &["SHELL"], *capacity), now)
                .unwrap();
        }
        (state, now)
    }

    #[test]
    fn test_reserve_prefers_least_loaded_ant() {
        let (mut state, now) = state_with(&[("ant-b", 4), ("ant-a", 4)]);
        let reservations = state.reserve_job_resources(1, &definition(), now).unwrap();

        // 负载相同按id，第二个任务落到另一个Ant上
        assert_eq!(reservations[0].ant_id, "ant-a");
        assert_eq!(reservations[1].ant_id, "ant-b");
        assert_eq!(state.registration("ant-a").unwrap().current_load, 1);
    }

    #[test]
    fn test_reserve_is_all_or_nothing() {
        let (mut state, now) = state_with(&[("ant-a", 1)]);
        let err = state.reserve_job_resources(1, &definition(), now).unwrap_err();
        assert!(matches!(err, SchedulerError::AntResourcesUnavailable(_)));
        assert!(state.all_reservations().is_empty());
        assert_eq!(state.registration("ant-a").unwrap().current_load, 0);
    }

    #[test]
    fn test_second_reservation_for_same_request_rejected() {
        let (mut state, now) = state_with(&[("ant-a", 10)]);
        state.reserve_job_resources(7, &definition(), now).unwrap();
        let err = state.reserve_job_resources(7, &definition(), now).unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyScheduled { id: 7 }));
        assert_eq!(state.reservations_for(7).len(), 2);
    }

    #[test]
    fn test_dry_run_accounts_for_planned_load() {
        let (mut state, now) = state_with(&[("ant-a", 1), ("ant-b", 1)]);
        let plan = state.check_job_resources(&definition(), now).unwrap();
        assert_ne!(plan[0].ant_id, plan[1].ant_id);
        assert!(state.all_reservations().is_empty());

        state.reserve_job_resources(1, &definition(), now).unwrap();
        assert!(state.check_job_resources(&definition(), now).is_err());
        assert_eq!(state.available_ants_for_job(&definition(), now), 0);
    }

    #[test]
    fn test_tags_must_all_match() {
        let now = Utc::now();
        let mut state = ResourceState::new(ALIVE, 10);
        state
            .add_registration(AntRegistration::new("gpu", &["SHELL"], 2).with_tags(&["gpu", "linux"]), now)
            .unwrap();
        state
            .add_registration(AntRegistration::new("plain", &["SHELL"], 2).with_tags(&["linux"]), now)
            .unwrap();

        let mut def = JobDefinition::new("d", "train", "alice")
            .with_task(TaskDefinition::new("fit", "SHELL").with_tags(&["gpu"]));
        def.tags = vec!["linux".to_string()];

        let reservations = state.reserve_job_resources(1, &def, now).unwrap();
        assert_eq!(reservations[0].ant_id, "gpu");
        assert!(state
            .has_ants_for_job_tags(&def.methods(), &["arm".to_string()], now)
            .is_err());
    }

    #[test]
    fn test_stale_ants_are_not_matched_and_reaped() {
        let (mut state, now) = state_with(&[("ant-a", 4)]);
        let later = now + chrono::Duration::seconds(16);

        assert!(state.check_job_resources(&definition(), later).is_err());
        assert!(state
            .has_ants_for_job_tags(&["SHELL".to_string()], &[], later)
            .is_err());

        assert_eq!(state.reap_stale_registrations(later), vec!["ant-a".to_string()]);
        assert!(state.registrations().is_empty());
    }

    #[test]
    fn test_heartbeat_allocations_count_towards_load() {
        let now = Utc::now();
        let mut state = ResourceState::new(ALIVE, 10);
        let mut registration = AntRegistration::new("ant-a", &["SHELL"], 2);
        registration.allocations.push(AntAllocation {
            job_request_id: 99,
            task_type: "remote".to_string(),
            allocated_at: now,
        });
        state.add_registration(registration, now).unwrap();

        assert_eq!(state.registration("ant-a").unwrap().current_load, 1);
        assert!(state.reserve_job_resources(1, &definition(), now).is_err());

        assert_eq!(state.release_job(99), 1);
        assert!(state.reserve_job_resources(1, &definition(), now).is_ok());
    }

    #[test]
    fn test_release_single_task_and_reap_old_allocations() {
        let (mut state, now) = state_with(&[("ant-a", 4)]);
        let reservations = state.reserve_job_resources(1, &definition(), now).unwrap();
        state.release(&reservations[0]).unwrap();
        assert_eq!(state.reservations_for(1).len(), 1);

        let later = now + chrono::Duration::hours(2);
        assert_eq!(state.reap_stale_allocations(Duration::from_secs(3600), later), 1);
        assert!(state.reservations_for(1).is_empty());
    }

    #[test]
    fn test_remove_registration_drops_its_reservations() {
        let (mut state, now) = state_with(&[("ant-a", 4)]);
        state.reserve_job_resources(1, &definition(), now).unwrap();
        state.remove_registration("ant-a");
        assert!(state.all_reservations().is_empty());

        let orphan = AntReservation {
            job_request_id: 1,
            task_type: "compile".to_string(),
            ant_id: "ant-a".to_string(),
            ant_topic: "ant-ant-a".to_string(),
            method: "SHELL".to_string(),
            current_load: 0,
            allocated_at: now,
        };
        assert!(matches!(state.release(&orphan), Err(SchedulerError::AntNotFound { .. })));
    }

    fn container(name: &str, request_id: u64, state: ContainerState, age_secs: i64) -> ContainerLifecycleEvent {
        let mut labels = HashMap::new();
        labels.insert(LABEL_JOB_REQUEST_ID.to_string(), request_id.to_string());
        ContainerLifecycleEvent {
            user_id: "alice".to_string(),
            ant_id: "ant-a".to_string(),
            method: "DOCKER".to_string(),
            container_name: name.to_string(),
            container_id: format!("id-{name}"),
            container_state: state,
            labels,
            started_at: Utc::now() - chrono::Duration::seconds(age_secs),
            ended_at: None,
        }
    }

    #[test]
    fn test_container_inventory() {
        let (mut state, now) = state_with(&[]);
        state.update_container(container("old", 1, ContainerState::Running, 100));
        state.update_container(container("new", 2, ContainerState::Running, 10));
        state.update_container(container("gone", 3, ContainerState::Running, 50));
        state.update_container(container("gone", 3, ContainerState::Completed, 50));

        let recent = state.containers(ContainerSort::Recent, now);
        let names: Vec<&str> = recent.iter().map(|e| e.container_name.as_str()).collect();
        assert_eq!(names, vec!["new", "old"]);
        let by_elapsed = state.containers(ContainerSort::Elapsed, now);
        assert_eq!(by_elapsed[0].container_name, "old");
        assert_eq!(state.count_containers().get("DOCKER"), Some(&2));
        assert_eq!(state.recent_container_events(1)[0].container_state, ContainerState::Completed);

        state.release_job(1);
        assert_eq!(state.containers(ContainerSort::Key, now).len(), 1);
    }
}
