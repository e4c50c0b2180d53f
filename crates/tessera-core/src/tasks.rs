//! Outstanding upstream requests
//!
//! Each request gets a [`TaskHandle`] carrying a fresh id and the receiving
//! end of a channel. The registry keeps the only sending end. A task is
//! resolved at most once: resolution removes the entry, so a late or
//! duplicate response finds nothing to resolve.
//!
//! ```text
//! caller thread                 registry                  I/O thread
//!   add_task ──────────────────▶ [entry{id, tx}]
//!   send(msg{task_uid: id})
//!   await_result ◀── Message ─── post(id, ..)   ◀──────── interim
//!                ◀── Activity ── touch(id)      ◀──────── poke
//!                ◀── Resolved ── resolve(id, ..) ◀─────── response
//! ```
//!
//! Waits are inactivity-bounded: every event received resets the deadline.

use crate::{Error, Result};
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use serde_json::Value;
use std::time::{Duration, Instant};
use tessera_protocol::{GenericResponse, WireMessage};
use uuid::Uuid;

/// Task identifier as carried in `task_uid`
pub type TaskId = String;

/// Response delivered to a waiting task
#[derive(Debug, Clone)]
pub struct Response {
    /// Success flag and reason
    pub generic: GenericResponse,
    /// Full JSON of the response
    pub json: Value,
    /// Trailer segments
    pub segments: Vec<Bytes>,
}

impl Response {
    /// Interpret a decoded message as a response
    pub fn from_message(message: WireMessage) -> Result<Self> {
        let generic = GenericResponse::from_json(&message.json)?;
        Ok(Self {
            generic,
            json: message.json,
            segments: message.segments,
        })
    }

    /// Local response that never crossed the wire
    pub fn local(generic: GenericResponse) -> Self {
        Self {
            generic,
            json: Value::Null,
            segments: Vec::new(),
        }
    }
}

/// Event delivered on a task's channel
#[derive(Debug)]
pub enum TaskEvent {
    /// Interim message for streaming callers
    Message(Response),
    /// Upstream reported progress without a message
    Activity,
    /// Final result; no further events follow
    Resolved(Result<Response>),
}

struct TaskEntry {
    id: TaskId,
    is_online: bool,
    created: Instant,
    sender: Sender<TaskEvent>,
}

/// Registry-side reference to a task, returned by [`TaskRegistry::find_task`]
#[derive(Debug, Clone)]
pub struct TaskRef {
    id: TaskId,
    is_online: bool,
    created: Instant,
    sender: Sender<TaskEvent>,
}

impl TaskRef {
    /// Task id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the task depends on the upstream connection
    pub fn is_online(&self) -> bool {
        self.is_online
    }

    /// Time since the task was added
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Deliver the final result. Only meaningful on a forgotten task.
    pub fn resolve(&self, result: Result<Response>) {
        // The waiter may have given up already
        let _ = self.sender.send(TaskEvent::Resolved(result));
    }

    /// Deliver an interim message
    pub fn post(&self, response: Response) {
        let _ = self.sender.send(TaskEvent::Message(response));
    }

    /// Reset the waiter's inactivity deadline
    pub fn touch(&self) {
        let _ = self.sender.send(TaskEvent::Activity);
    }
}

/// Caller-side handle of an outstanding request
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    is_online: bool,
    timeout: Option<Duration>,
    receiver: Receiver<TaskEvent>,
}

impl TaskHandle {
    /// Task id, to be put in the request's `task_uid`
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the task depends on the upstream connection
    pub fn is_online(&self) -> bool {
        self.is_online
    }

    /// Inactivity timeout given at creation
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Registry of outstanding tasks
pub struct TaskRegistry {
    tasks: Mutex<Vec<TaskEntry>>,
    grace_period: Duration,
}

impl TaskRegistry {
    /// Create a registry. Indefinite waits warn once after `grace_period`.
    pub fn new(grace_period: Duration) -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            grace_period,
        }
    }

    /// Register a new task with a fresh id
    pub fn add_task(&self, is_online: bool, timeout: Option<Duration>) -> TaskHandle {
        let (sender, receiver) = unbounded();
        let id = Uuid::new_v4().to_string();
        self.tasks.lock().push(TaskEntry {
            id: id.clone(),
            is_online,
            created: Instant::now(),
            sender,
        });
        TaskHandle {
            id,
            is_online,
            timeout,
            receiver,
        }
    }

    /// Look a task up by id; with `forget` it is removed in the same step.
    ///
    /// Lookup is linear. Outstanding task counts stay small (a handful of
    /// requests plus one chunk window), so this is not a hot path.
    pub fn find_task(&self, id: &str, forget: bool) -> Option<TaskRef> {
        let mut tasks = self.tasks.lock();
        let pos = tasks.iter().position(|t| t.id == id)?;
        let entry = if forget {
            tasks.remove(pos)
        } else {
            let t = &tasks[pos];
            return Some(TaskRef {
                id: t.id.clone(),
                is_online: t.is_online,
                created: t.created,
                sender: t.sender.clone(),
            });
        };
        Some(TaskRef {
            id: entry.id,
            is_online: entry.is_online,
            created: entry.created,
            sender: entry.sender,
        })
    }

    /// Remove and resolve a task. Returns `false` for an unknown id.
    pub fn resolve(&self, id: &str, result: Result<Response>) -> bool {
        match self.find_task(id, true) {
            Some(task) => {
                task.resolve(result);
                true
            }
            None => false,
        }
    }

    /// Reset a task's inactivity deadline. Returns `false` for an unknown id.
    pub fn touch(&self, id: &str) -> bool {
        match self.find_task(id, false) {
            Some(task) => {
                task.touch();
                true
            }
            None => false,
        }
    }

    /// Drop a task without resolving it
    pub fn forget(&self, id: &str) {
        self.tasks.lock().retain(|t| t.id != id);
    }

    /// Resolve every online task with [`Error::Disconnected`]; offline tasks
    /// are untouched. Returns the number cancelled.
    pub fn cancel_online_tasks(&self) -> usize {
        let cancelled: Vec<TaskEntry> = {
            let mut tasks = self.tasks.lock();
            let (online, offline) = std::mem::take(&mut *tasks)
                .into_iter()
                .partition(|t| t.is_online);
            *tasks = offline;
            online
        };
        for task in &cancelled {
            let _ = task
                .sender
                .send(TaskEvent::Resolved(Err(Error::Disconnected)));
        }
        if !cancelled.is_empty() {
            tracing::debug!("Cancelled {} online tasks", cancelled.len());
        }
        cancelled.len()
    }

    /// Number of outstanding tasks
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Whether no task is outstanding
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Block until `task` resolves or stays inactive for longer than
    /// `timeout`.
    ///
    /// Interim messages go to `on_message` and count as activity. `None` or a
    /// zero timeout waits indefinitely, logging a single warning once the wait
    /// passes the grace period. A timed-out task is forgotten.
    pub fn await_result(
        &self,
        task: &TaskHandle,
        timeout: Option<Duration>,
        mut on_message: Option<&mut dyn FnMut(Response)>,
    ) -> Result<Response> {
        let timeout = timeout.filter(|limit| !limit.is_zero());
        let started = Instant::now();
        let mut last_activity = started;
        let mut warned = false;

        loop {
            let wait = match timeout {
                Some(limit) => {
                    let idle = last_activity.elapsed();
                    if idle >= limit {
                        // A result that landed right at the deadline still wins
                        while let Ok(event) = task.receiver.try_recv() {
                            if let TaskEvent::Resolved(result) = event {
                                return result;
                            }
                        }
                        self.forget(&task.id);
                        return Err(Error::Timeout);
                    }
                    Some(limit - idle)
                }
                None if !warned => Some(self.grace_period.saturating_sub(started.elapsed())),
                None => None,
            };

            let event = match wait {
                Some(wait) => task.receiver.recv_timeout(wait),
                None => task
                    .receiver
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };

            match event {
                Ok(TaskEvent::Resolved(result)) => return result,
                Ok(TaskEvent::Message(response)) => {
                    last_activity = Instant::now();
                    match on_message.as_mut() {
                        Some(callback) => callback(response),
                        None => tracing::debug!(
                            "Dropping interim message for task {} without a listener",
                            task.id
                        ),
                    }
                }
                Ok(TaskEvent::Activity) => last_activity = Instant::now(),
                Err(RecvTimeoutError::Timeout) => {
                    if timeout.is_none() && !warned && started.elapsed() >= self.grace_period {
                        tracing::warn!(
                            "Still waiting for a response to task {} after {:?}",
                            task.id,
                            started.elapsed()
                        );
                        warned = true;
                    }
                }
                // Registry dropped the entry without resolving it
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Disconnected),
            }
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    fn ok_response() -> Response {
        Response::local(GenericResponse::ok("done"))
    }

    #[test]
    fn test_add_and_find() {
        let registry = TaskRegistry::default();
        let a = registry.add_task(true, None);
        let b = registry.add_task(false, Some(Duration::from_secs(1)));
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);

        let found = registry.find_task(a.id(), false).unwrap();
        assert!(found.is_online());
        assert_eq!(registry.len(), 2);

        registry.find_task(a.id(), true).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.find_task(a.id(), false).is_none());
    }

    #[test]
    fn test_resolve_once() {
        let registry = TaskRegistry::default();
        let task = registry.add_task(true, None);
        assert!(registry.resolve(task.id(), Ok(ok_response())));
        assert!(!registry.resolve(task.id(), Ok(ok_response())));

        let result = registry.await_result(&task, Some(Duration::from_millis(50)), None);
        assert_eq!(result.unwrap().generic.reason, "done");
    }

    #[test]
    fn test_await_times_out_and_forgets() {
        let registry = TaskRegistry::default();
        let task = registry.add_task(true, None);
        let result = registry.await_result(&task, Some(Duration::from_millis(30)), None);
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_interim_messages_reset_inactivity() {
        let registry = Arc::new(TaskRegistry::default());
        let task = registry.add_task(true, None);
        let id = task.id().to_string();

        let producer = {
            let registry = registry.clone();
            thread::spawn(move || {
                for i in 0..5 {
                    thread::sleep(Duration::from_millis(40));
                    let task = registry.find_task(&id, false).unwrap();
                    task.post(Response {
                        generic: GenericResponse::ok(""),
                        json: json!({ "step": i }),
                        segments: vec![],
                    });
                }
                thread::sleep(Duration::from_millis(40));
                registry.resolve(&id, Ok(Response::local(GenericResponse::ok("final"))));
            })
        };

        let mut seen = Vec::new();
        let mut on_message = |r: Response| seen.push(r.json["step"].as_i64().unwrap());
        let result = registry
            .await_result(
                &task,
                Some(Duration::from_millis(100)),
                Some(&mut on_message as &mut dyn FnMut(Response)),
            )
            .unwrap();
        producer.join().unwrap();

        assert_eq!(result.generic.reason, "final");
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_touch_keeps_wait_alive() {
        let registry = Arc::new(TaskRegistry::default());
        let task = registry.add_task(true, None);
        let id = task.id().to_string();

        let toucher = {
            let registry = registry.clone();
            thread::spawn(move || {
                for _ in 0..4 {
                    thread::sleep(Duration::from_millis(30));
                    assert!(registry.touch(&id));
                }
                registry.resolve(&id, Ok(Response::local(GenericResponse::ok(""))));
            })
        };

        let result = registry.await_result(&task, Some(Duration::from_millis(80)), None);
        toucher.join().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_cancel_online_tasks_only() {
        let registry = TaskRegistry::default();
        let online: Vec<_> = (0..4).map(|_| registry.add_task(true, None)).collect();
        let offline = registry.add_task(false, None);

        assert_eq!(registry.cancel_online_tasks(), 4);
        assert_eq!(registry.len(), 1);

        for task in &online {
            let result = registry.await_result(task, Some(Duration::from_millis(10)), None);
            assert!(matches!(result, Err(Error::Disconnected)));
        }
        assert!(registry.find_task(offline.id(), false).is_some());
    }

    #[test]
    fn test_indefinite_wait_survives_grace_period() {
        let registry = Arc::new(TaskRegistry::new(Duration::from_millis(20)));
        let task = registry.add_task(false, None);
        let id = task.id().to_string();

        let resolver = {
            let registry = registry.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(80));
                registry.resolve(&id, Ok(Response::local(GenericResponse::ok("late"))));
            })
        };

        let result = registry.await_result(&task, None, None).unwrap();
        resolver.join().unwrap();
        assert_eq!(result.generic.reason, "late");
    }

    #[test]
    fn test_zero_timeout_waits_indefinitely() {
        let registry = Arc::new(TaskRegistry::default());
        let done = registry.add_task(true, None);
        registry.resolve(done.id(), Ok(ok_response()));
        let result = registry.await_result(&done, Some(Duration::ZERO), None);
        assert_eq!(result.unwrap().generic.reason, "done");

        let task = registry.add_task(true, None);
        let id = task.id().to_string();
        let resolver = {
            let registry = registry.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(60));
                registry.resolve(&id, Ok(Response::local(GenericResponse::ok("later"))));
            })
        };
        let result = registry.await_result(&task, Some(Duration::ZERO), None).unwrap();
        resolver.join().unwrap();
        assert_eq!(result.generic.reason, "later");
    }

    #[test]
    fn test_resolved_result_beats_expired_deadline() {
        let registry = TaskRegistry::default();
        let task = registry.add_task(true, None);
        registry.resolve(task.id(), Ok(ok_response()));
        thread::sleep(Duration::from_millis(5));

        let result = registry.await_result(&task, Some(Duration::from_nanos(1)), None);
        assert_eq!(result.unwrap().generic.reason, "done");
    }
}
