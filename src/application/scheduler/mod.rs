//! Reads task files and fires due tasks against their registered
//! handler. Grounded on `scheduler/runner.py`'s `Scheduler`. Cron fields
//! are evaluated in the scheduler's configured timezone, not UTC --
//! a user who writes `0 9 * * *` means 9am local, not 9am UTC. Unlike
//! the Python original's sequential per-tick loop, every due task is
//! fired on its own spawned task: two tasks due in the same tick run
//! concurrently, and a slow handler never delays the next tick.

pub mod cron;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::application::bus::EventBus;
use crate::application::registry::PluginRegistry;
use crate::domain::event::{event_types, Event};
use crate::domain::task::{Task, TaskStatus, TaskType};
use crate::infrastructure::store::Store;

use cron::cron_matches;

pub struct Scheduler {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    registry: Arc<PluginRegistry>,
    timezone: Tz,
    check_interval: std::time::Duration,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        registry: Arc<PluginRegistry>,
        timezone: Tz,
        check_interval: std::time::Duration,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            timezone,
            check_interval,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Starts the background check loop. No-op if already running.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);

        let scheduler = self.clone();
        *handle = Some(tokio::spawn(async move {
            scheduler.run_loop().await;
        }));
        info!(check_interval_secs = self.check_interval.as_secs(), "scheduler started");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
        info!("scheduler stopped");
    }

    async fn run_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.check_interval);
        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if let Err(e) = self.check_tasks().await {
                error!(error = %e, "error in scheduler loop");
            }
        }
    }

    /// Fires every due task concurrently: two tasks due in the same tick
    /// must run side by side, and a slow handler must never delay the
    /// next tick or another task firing in this one.
    pub async fn check_tasks(self: &Arc<Self>) -> anyhow::Result<()> {
        let tasks: Vec<Task> = self.store.list_json("tasks").await?;
        let now = Utc::now();
        for task in tasks {
            if !task.enabled {
                continue;
            }
            if self.is_due(&task, now)? {
                let scheduler = self.clone();
                tokio::spawn(async move { scheduler.fire_task(task, now).await });
            }
        }
        Ok(())
    }

    fn is_due(&self, task: &Task, now: chrono::DateTime<Utc>) -> anyhow::Result<bool> {
        if let Some(run_at) = task.run_at {
            return Ok(task.last_run_at.is_none() && now >= run_at);
        }

        if let Some(expr) = &task.cron_expression {
            if let Some(last) = task.last_run_at {
                let last_local = last.with_timezone(&self.timezone);
                let now_local = now.with_timezone(&self.timezone);
                use chrono::{Datelike, Timelike};
                if last_local.year() == now_local.year()
                    && last_local.month() == now_local.month()
                    && last_local.day() == now_local.day()
                    && last_local.hour() == now_local.hour()
                    && last_local.minute() == now_local.minute()
                {
                    return Ok(false);
                }
            }
            let now_local = now.with_timezone(&self.timezone);
            return cron_matches(expr, &now_local);
        }

        if task.task_type == TaskType::Research {
            return Ok(task.last_run_at.is_none());
        }

        Ok(false)
    }

    async fn fire_task(&self, mut task: Task, now: chrono::DateTime<Utc>) {
        info!(task_id = %task.id, task_name = %task.name, handler = %task.handler, "firing task");

        let fired = Event::new(
            event_types::SCHEDULE_FIRED,
            "scheduler",
            serde_json::json!({
                "task_id": task.id,
                "task_name": task.name,
                "handler": task.handler,
                "params": task.params,
            }),
        );
        self.bus.publish(fired).await;

        let result = match self.registry.get_task_handler(&task.handler).await {
            Ok(handler) => match std::panic::AssertUnwindSafe(handler.run(task.params.clone()))
                .catch_unwind()
                .await
            {
                Ok(result) => {
                    info!(task_name = %task.name, status = ?result.status, message = %result.message, "task completed");
                    result
                }
                Err(_) => crate::domain::task::TaskResult::error("task handler panicked"),
            },
            Err(_) => {
                warn!(handler = %task.handler, "no handler registered for task");
                crate::domain::task::TaskResult {
                    status: TaskStatus::NoAction,
                    message: "No handler found".to_string(),
                    created_tasks: Vec::new(),
                }
            }
        };

        task.last_run_at = Some(now);
        task.last_result = Some(result.status);
        task.run_count += 1;

        if matches!(task.task_type, TaskType::OneOff | TaskType::Research) {
            task.enabled = false;
        }

        if let Err(e) = self.store.write_json("tasks", &task.id, &task).await {
            error!(error = %e, task_id = %task.id, "failed to persist task after firing");
        }
    }

    pub async fn create_task(&self, task: Task) -> anyhow::Result<Task> {
        self.store.write_json("tasks", &task.id, &task).await?;

        let event = Event::new(
            event_types::TASK_CREATED,
            "scheduler",
            serde_json::json!({
                "task_id": task.id,
                "task_name": task.name,
                "type": task.task_type,
                "handler": task.handler,
                "created_by": task.created_by,
            }),
        );
        self.bus.publish(event).await;

        info!(task_name = %task.name, task_type = ?task.task_type, "created task");
        Ok(task)
    }

    pub async fn delete_task(&self, task_id: &str) -> anyhow::Result<bool> {
        let deleted = self.store.delete_entity("tasks", task_id).await?;
        if deleted {
            info!(task_id, "deleted task");
        }
        Ok(deleted)
    }

    pub async fn list_tasks(&self) -> anyhow::Result<Vec<Task>> {
        Ok(self.store.list_json("tasks").await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::bus::EventBus as Bus;
    use crate::domain::task::CreatedBy;
    use async_trait::async_trait;
    use chrono::Duration;
    use tempfile::tempdir;

    struct EchoHandler;
    #[async_trait]
    impl crate::domain::ports::TaskHandler for EchoHandler {
        fn name(&self) -> &str {
            "echo"
        }
        async fn run(&self, _params: serde_json::Value) -> crate::domain::task::TaskResult {
            crate::domain::task::TaskResult::success("ran")
        }
    }

    async fn temp_scheduler() -> (Arc<Scheduler>, Arc<Store>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.keep()).await.unwrap());
        let bus = Arc::new(Bus::new(store.clone()));
        let registry = Arc::new(PluginRegistry::new());
        registry.register_task_handler("echo", Arc::new(EchoHandler)).await;
        let scheduler = Arc::new(Scheduler::new(store.clone(), bus, registry, chrono_tz::UTC, std::time::Duration::from_secs(60)));
        (scheduler, store)
    }

    /// `check_tasks` spawns each due task's handler rather than awaiting
    /// it inline, so tests give spawned work a beat to land before
    /// asserting on the persisted result.
    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn run_at_task_fires_once() {
        let (scheduler, _store) = temp_scheduler().await;
        let mut task = Task::new("one-shot", TaskType::OneOff, "echo", serde_json::json!({}), CreatedBy::Human);
        task.run_at = Some(Utc::now() - Duration::minutes(1));
        scheduler.create_task(task.clone()).await.unwrap();

        scheduler.check_tasks().await.unwrap();
        settle().await;
        let reloaded = scheduler.list_tasks().await.unwrap();
        let reloaded = reloaded.into_iter().find(|t| t.id == task.id).unwrap();
        assert_eq!(reloaded.run_count, 1);
        assert!(!reloaded.enabled);

        scheduler.check_tasks().await.unwrap();
        settle().await;
        let reloaded2 = scheduler.list_tasks().await.unwrap();
        let reloaded2 = reloaded2.into_iter().find(|t| t.id == task.id).unwrap();
        assert_eq!(reloaded2.run_count, 1);
    }

    #[tokio::test]
    async fn future_run_at_does_not_fire() {
        let (scheduler, _store) = temp_scheduler().await;
        let mut task = Task::new("future", TaskType::OneOff, "echo", serde_json::json!({}), CreatedBy::Human);
        task.run_at = Some(Utc::now() + Duration::hours(1));
        scheduler.create_task(task.clone()).await.unwrap();

        scheduler.check_tasks().await.unwrap();
        settle().await;
        let reloaded = scheduler.list_tasks().await.unwrap();
        let reloaded = reloaded.into_iter().find(|t| t.id == task.id).unwrap();
        assert_eq!(reloaded.run_count, 0);
    }

    #[tokio::test]
    async fn research_task_fires_once_when_never_run() {
        let (scheduler, _store) = temp_scheduler().await;
        let task = Task::new("research-me", TaskType::Research, "echo", serde_json::json!({}), CreatedBy::Ai);
        scheduler.create_task(task.clone()).await.unwrap();

        scheduler.check_tasks().await.unwrap();
        settle().await;
        let reloaded = scheduler.list_tasks().await.unwrap();
        let reloaded = reloaded.into_iter().find(|t| t.id == task.id).unwrap();
        assert_eq!(reloaded.run_count, 1);
        assert!(!reloaded.enabled);
    }

    #[tokio::test]
    async fn delete_task_removes_file() {
        let (scheduler, _store) = temp_scheduler().await;
        let task = Task::new("throwaway", TaskType::OneOff, "echo", serde_json::json!({}), CreatedBy::Human);
        scheduler.create_task(task.clone()).await.unwrap();
        assert!(scheduler.delete_task(&task.id).await.unwrap());
        assert!(!scheduler.delete_task(&task.id).await.unwrap());
    }
}
