//! Interval scheduling and run-all execution.
//!
//! The scheduler owns the timer loop that feeds the task queue and is also
//! the queue's executor: a dequeued task fans out into one measurement per
//! ordered device pair, run strictly sequentially so two tests never collide
//! on the target's data-plane port.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::alerts::AlertEngine;
use crate::db::{Measurement, Store, TestKind};
use crate::events::{Event, EventBus};
use crate::orchestrator::Orchestrator;
use crate::queue::{Priority, QueueStatus, Task, TaskExecutor, TaskQueue, TaskType};

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_SPEED_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Live view of one schedule, published on the event bus.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleInfo {
    #[serde(rename = "type")]
    pub kind: TestKind,
    pub interval: String,
    pub enabled: bool,
    /// RFC 3339, or empty when the schedule is disabled.
    pub next_run: String,
}

#[derive(Debug, Clone, Copy)]
struct TrackedSchedule {
    interval: Duration,
    enabled: bool,
    next_run: Option<DateTime<Utc>>,
}

impl TrackedSchedule {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            enabled: true,
            next_run: None,
        }
    }
}

struct ScheduleState {
    ping: TrackedSchedule,
    speed: TrackedSchedule,
}

pub struct Scheduler {
    store: Arc<Store>,
    orchestrator: Arc<Orchestrator>,
    queue: Arc<TaskQueue>,
    bus: EventBus,
    alerts: Arc<AlertEngine>,
    state: Mutex<ScheduleState>,
    stop_tx: Mutex<Option<broadcast::Sender<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        orchestrator: Arc<Orchestrator>,
        queue: Arc<TaskQueue>,
        bus: EventBus,
        alerts: Arc<AlertEngine>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            queue,
            bus,
            alerts,
            state: Mutex::new(ScheduleState {
                ping: TrackedSchedule::new(DEFAULT_PING_INTERVAL),
                speed: TrackedSchedule::new(DEFAULT_SPEED_INTERVAL),
            }),
            stop_tx: Mutex::new(None),
        }
    }

    /// Start the queue consumer and the timer loop.
    pub fn start(self: Arc<Self>) {
        let _ = self.queue.clone().start(self.clone());
        info!("scheduler started");
        self.start_loop();
    }

    /// Stop the timer loop and restart it with freshly read schedules.
    /// Queued tasks are preserved.
    pub fn reload(self: Arc<Self>) {
        self.stop_loop();
        info!("scheduler reloaded");
        self.start_loop();
    }

    /// Cooperative shutdown: the loop stops and the queue drains its current
    /// task before the consumer exits.
    pub fn stop(&self) {
        self.stop_loop();
        self.queue.stop();
    }

    fn stop_loop(&self) {
        if let Some(tx) = self.stop_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    fn start_loop(self: Arc<Self>) {
        let (tx, rx) = broadcast::channel(1);
        *self.stop_tx.lock().unwrap() = Some(tx);
        tokio::spawn(async move {
            self.run_loop(rx).await;
        });
    }

    async fn run_loop(self: Arc<Self>, mut stop_rx: broadcast::Receiver<()>) {
        let mut ping = TrackedSchedule::new(DEFAULT_PING_INTERVAL);
        let mut speed = TrackedSchedule::new(DEFAULT_SPEED_INTERVAL);

        match self.store.get_schedules() {
            Ok(schedules) => {
                for schedule in schedules {
                    let tracked = match schedule.kind {
                        TestKind::Ping => &mut ping,
                        TestKind::Speed => &mut speed,
                    };
                    match parse_duration(&schedule.interval) {
                        Ok(interval) => {
                            tracked.interval = interval;
                            tracked.enabled = schedule.enabled;
                        }
                        Err(e) => warn!(
                            kind = %schedule.kind, interval = %schedule.interval,
                            "invalid schedule interval ({}); keeping default", e
                        ),
                    }
                }
            }
            Err(e) => warn!("failed to read schedules; using defaults: {}", e),
        }

        let now = Utc::now();
        if ping.enabled {
            ping.next_run = Some(now + chrono_interval(ping.interval));
        }
        if speed.enabled {
            speed.next_run = Some(now + chrono_interval(speed.interval));
        }
        {
            let mut state = self.state.lock().unwrap();
            state.ping = ping;
            state.speed = speed;
        }
        self.publish_schedule_info();

        info!(
            ping_interval = ?ping.interval, ping_enabled = ping.enabled,
            speed_interval = ?speed.interval, speed_enabled = speed.enabled,
            "schedule loop running"
        );

        // interval_at so the first tick fires after one full period.
        let start = tokio::time::Instant::now();
        let mut ping_tick = tokio::time::interval_at(start + ping.interval, ping.interval);
        let mut speed_tick = tokio::time::interval_at(start + speed.interval, speed.interval);
        ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        speed_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    info!("schedule loop stopping");
                    return;
                }
                _ = ping_tick.tick() => {
                    if ping.enabled {
                        self.on_tick(TestKind::Ping);
                    }
                }
                _ = speed_tick.tick() => {
                    if speed.enabled {
                        self.on_tick(TestKind::Speed);
                    }
                }
            }
        }
    }

    fn on_tick(&self, kind: TestKind) {
        {
            let mut state = self.state.lock().unwrap();
            let tracked = match kind {
                TestKind::Ping => &mut state.ping,
                TestKind::Speed => &mut state.speed,
            };
            tracked.next_run = Some(Utc::now() + chrono_interval(tracked.interval));
        }
        self.publish_schedule_info();

        let task_type = match kind {
            TestKind::Ping => TaskType::PingAll,
            TestKind::Speed => TaskType::SpeedAll,
        };
        self.queue.enqueue(Task::new(task_type, Priority::Normal));
    }

    /// Manually trigger a full ping round at high priority.
    pub fn trigger_ping_all(&self) {
        self.queue.enqueue(Task::new(TaskType::PingAll, Priority::High));
        info!("manual ping round enqueued");
    }

    /// Manually trigger a full speed round at high priority.
    pub fn trigger_speed_all(&self) {
        self.queue.enqueue(Task::new(TaskType::SpeedAll, Priority::High));
        info!("manual speed round enqueued");
    }

    pub fn schedule_info(&self) -> Vec<ScheduleInfo> {
        let state = self.state.lock().unwrap();
        let now = Utc::now();
        [
            (TestKind::Ping, &state.ping),
            (TestKind::Speed, &state.speed),
        ]
        .into_iter()
        .map(|(kind, tracked)| {
            let next_run = match (tracked.enabled, tracked.next_run) {
                (true, Some(at)) if at > now => at.to_rfc3339(),
                (true, Some(_)) => (now + chrono_interval(tracked.interval)).to_rfc3339(),
                _ => String::new(),
            };
            ScheduleInfo {
                kind,
                interval: format_duration(tracked.interval),
                enabled: tracked.enabled,
                next_run,
            }
        })
        .collect()
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    fn publish_schedule_info(&self) {
        self.bus.publish(Event::Schedule(self.schedule_info()));
    }

    /// Run one measurement for every ordered device pair, sequentially.
    async fn run_all(&self, kind: TestKind) {
        let devices = match self.store.list_devices() {
            Ok(devices) => devices,
            Err(e) => {
                error!("failed to list devices: {}", e);
                return;
            }
        };

        for source in &devices {
            for target in &devices {
                if source.id == target.id {
                    continue;
                }

                let status = match kind {
                    TestKind::Ping => format!("Pinging {} -> {}", source.name, target.name),
                    TestKind::Speed => format!("Speed test {} -> {}", source.name, target.name),
                };
                self.bus.publish(Event::Status(status));

                let result = match kind {
                    TestKind::Ping => self.orchestrator.run_ping(source, target).await,
                    TestKind::Speed => self.orchestrator.run_speed(source, target).await,
                };

                let measurement = match result {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(%kind, source = %source.name, target = %target.name, "measurement failed: {}", e);
                        Measurement::failure(source.id, target.id, kind, e.to_string())
                    }
                };

                // A persist failure must not suppress the live update.
                if let Err(e) = self.store.insert_result(&measurement) {
                    error!("failed to persist result: {}", e);
                }
                self.bus.publish(Event::Result(measurement.clone()));
                self.alerts.process(&measurement, &devices).await;
            }
        }

        self.bus.publish(Event::Status("Idle".to_string()));
    }
}

#[async_trait]
impl TaskExecutor for Scheduler {
    async fn execute(&self, task: Task) {
        info!(id = %task.id, kind = ?task.kind, priority = ?task.priority, "executing task");
        self.bus.publish(Event::Queue(self.queue.status()));

        self.run_all(task.kind.test_kind()).await;

        self.bus.publish(Event::Queue(self.queue.status()));
    }
}

fn chrono_interval(d: Duration) -> chrono::TimeDelta {
    chrono::TimeDelta::from_std(d).unwrap_or(chrono::TimeDelta::MAX)
}

/// Parse a duration string like "30s", "5m", "1h" or "1m30s".
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let mut unit = String::from(c);
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphabetic() {
                unit.push(next);
                chars.next();
            } else {
                break;
            }
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("missing value before unit '{}'", unit))?;
        digits.clear();

        total += match unit.as_str() {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            other => return Err(format!("unknown unit '{}'", other)),
        };
    }

    if !digits.is_empty() {
        return Err(format!("missing unit after '{}'", digits));
    }
    if total.is_zero() {
        return Err("duration must be positive".to_string());
    }
    Ok(total)
}

/// Render a duration the way schedules are written ("1m30s", "1h", "45s").
pub fn format_duration(d: Duration) -> String {
    let mut secs = d.as_secs();
    if secs == 0 {
        return format!("{}ms", d.subsec_millis());
    }

    let hours = secs / 3600;
    secs %= 3600;
    let minutes = secs / 60;
    let seconds = secs % 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if seconds > 0 || out.is_empty() {
        out.push_str(&format!("{}s", seconds));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationManager;
    use crate::queue::TaskType;
    use tempfile::NamedTempFile;

    fn build_scheduler(store: Arc<Store>) -> Arc<Scheduler> {
        let orchestrator = Arc::new(Orchestrator::new(
            "./lanpulse-worker".into(),
            8090,
            "/dev/null".into(),
        ));
        let queue = Arc::new(TaskQueue::new());
        let bus = EventBus::new();
        let notifier = Arc::new(NotificationManager::new(store.clone()));
        let alerts = Arc::new(AlertEngine::new(store.clone(), notifier));
        Arc::new(Scheduler::new(store, orchestrator, queue, bus, alerts))
    }

    #[test]
    fn parse_duration_accepts_common_forms() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("0s").is_err());
    }

    #[test]
    fn format_duration_matches_schedule_style() {
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(60)), "1m");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::from_secs(3630)), "1h30s");
    }

    #[tokio::test(start_paused = true)]
    async fn tick_enqueues_normal_priority_task() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        store.upsert_schedule(TestKind::Ping, "30s", true).unwrap();
        store.upsert_schedule(TestKind::Speed, "1h", false).unwrap();

        let scheduler = build_scheduler(store);
        // Timer loop only; no consumer, so enqueued tasks stay visible.
        scheduler.clone().start_loop();

        tokio::time::sleep(Duration::from_secs(31)).await;

        let status = scheduler.queue_status();
        assert_eq!(status.length, 1);
        assert_eq!(status.queued[0].kind, TaskType::PingAll);
        assert_eq!(status.queued[0].priority, Priority::Normal);

        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_schedule_never_ticks() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        store.upsert_schedule(TestKind::Ping, "30s", false).unwrap();

        let scheduler = build_scheduler(store);
        scheduler.clone().start_loop();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(scheduler.queue_status().length, 0);

        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn reload_picks_up_shorter_interval() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        store.upsert_schedule(TestKind::Ping, "1h", true).unwrap();

        let scheduler = build_scheduler(store.clone());
        scheduler.clone().start_loop();
        tokio::time::sleep(Duration::from_secs(1)).await;

        store.upsert_schedule(TestKind::Ping, "30s", true).unwrap();
        scheduler.clone().reload();

        tokio::time::sleep(Duration::from_secs(31)).await;
        let status = scheduler.queue_status();
        assert_eq!(status.length, 1);
        assert_eq!(status.queued[0].kind, TaskType::PingAll);

        let info = scheduler.schedule_info();
        let ping = info.iter().find(|s| s.kind == TestKind::Ping).unwrap();
        assert_eq!(ping.interval, "30s");
        assert!(!ping.next_run.is_empty());

        scheduler.stop();
    }

    #[tokio::test]
    async fn manual_triggers_are_high_priority() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let scheduler = build_scheduler(store);

        scheduler.trigger_speed_all();
        let status = scheduler.queue_status();
        assert_eq!(status.length, 1);
        assert_eq!(status.queued[0].kind, TaskType::SpeedAll);
        assert_eq!(status.queued[0].priority, Priority::High);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_event_is_published_on_start() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        store.upsert_schedule(TestKind::Ping, "1m", true).unwrap();

        let scheduler = build_scheduler(store);
        let mut events = scheduler.bus.subscribe();
        scheduler.clone().start_loop();
        tokio::time::sleep(Duration::from_millis(10)).await;

        match events.try_recv() {
            Ok(Event::Schedule(info)) => {
                let ping = info.iter().find(|s| s.kind == TestKind::Ping).unwrap();
                assert_eq!(ping.interval, "1m");
                assert!(ping.enabled);
            }
            other => panic!("expected schedule event, got {:?}", other.map(|e| serde_json::to_string(&e).unwrap())),
        }

        scheduler.stop();
    }
}
