//! Workflow-scoped event bus.
//!
//! One producer side shared by the engine, any number of consumers.
//! Emission never blocks: when a consumer falls behind, events are
//! dropped (and counted) rather than back-pressuring the producer. The
//! renderer dispatch keeps one live renderer per workflow, created on
//! `workflow.start` and torn down by the matching `workflow.end`.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use uuid::Uuid;

use coffre_types::Mac;

pub const WORKFLOW_START: &str = "workflow.start";
pub const WORKFLOW_END: &str = "workflow.end";

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: String,
    pub workflow: String,
    pub job: Uuid,
    pub snapshot: Mac,
    pub level: String,
    pub data: BTreeMap<String, serde_json::Value>,
}

impl Event {
    pub fn new(kind: &str, workflow: &str, job: Uuid) -> Event {
        Event {
            kind: kind.to_string(),
            workflow: workflow.to_string(),
            job,
            snapshot: Mac::ZERO,
            level: "info".to_string(),
            data: BTreeMap::new(),
        }
    }

    pub fn with_snapshot(mut self, snapshot: Mac) -> Event {
        self.snapshot = snapshot;
        self
    }

    pub fn with_level(mut self, level: &str) -> Event {
        self.level = level.to_string();
        self
    }

    pub fn with_data(mut self, key: &str, value: serde_json::Value) -> Event {
        self.data.insert(key.to_string(), value);
        self
    }
}

const BUS_CAPACITY: usize = 1024;

/// The producer handle. Cloneable; all clones feed the same consumers.
#[derive(Clone)]
pub struct EventBus {
    tx: Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> (EventBus, Receiver<Event>) {
        let (tx, rx) = crossbeam_channel::bounded(BUS_CAPACITY);
        (
            EventBus {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Emit without ever blocking the caller. Drops are counted, with
    /// one exception: `workflow.end` must reach the consumer, so it
    /// blocks if it has to.
    pub fn emit(&self, event: Event) {
        if event.kind == WORKFLOW_END {
            let _ = self.tx.send(event);
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A live per-workflow renderer.
pub trait Renderer: Send {
    fn handle(&mut self, event: &Event);
    fn finish(&mut self);
}

/// Drain the receiver, routing events to per-workflow renderers built by
/// `factory`. Returns when the bus is closed.
pub fn dispatch<F>(rx: Receiver<Event>, factory: F)
where
    F: Fn(&Event) -> Box<dyn Renderer>,
{
    let mut live: HashMap<String, (Uuid, Box<dyn Renderer>)> = HashMap::new();

    for event in rx.iter() {
        if event.kind == WORKFLOW_START {
            let mut renderer = factory(&event);
            renderer.handle(&event);
            live.insert(event.workflow.clone(), (event.job, renderer));
            continue;
        }

        if let Some((job, renderer)) = live.get_mut(&event.workflow) {
            renderer.handle(&event);
            if event.kind == WORKFLOW_END && event.job == *job {
                renderer.finish();
                live.remove(&event.workflow);
            }
        }
        // Events for workflows without a live renderer are dropped.
    }

    for (_, (_, mut renderer)) in live.drain() {
        renderer.finish();
    }
}

/// Renderer that forwards events to the log stream.
pub struct StdioRenderer;

impl Renderer for StdioRenderer {
    fn handle(&mut self, event: &Event) {
        match event.level.as_str() {
            "error" => tracing::error!(
                workflow = %event.workflow,
                job = %event.job,
                "{}",
                event.kind
            ),
            "warn" => tracing::warn!(
                workflow = %event.workflow,
                job = %event.job,
                "{}",
                event.kind
            ),
            _ => tracing::info!(
                workflow = %event.workflow,
                job = %event.job,
                "{}",
                event.kind
            ),
        }
    }

    fn finish(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingState {
        seen: Vec<String>,
        finished: bool,
    }

    struct RecordingRenderer(Arc<Mutex<RecordingState>>);

    impl Renderer for RecordingRenderer {
        fn handle(&mut self, event: &Event) {
            self.0.lock().unwrap().seen.push(event.kind.clone());
        }
        fn finish(&mut self) {
            self.0.lock().unwrap().finished = true;
        }
    }

    #[test]
    fn renderer_lifecycle_follows_workflow() {
        let (bus, rx) = EventBus::new();
        let job = Uuid::from_u128(1);
        let state = Arc::new(Mutex::new(RecordingState::default()));

        let state_for_factory = Arc::clone(&state);
        let handle = std::thread::spawn(move || {
            dispatch(rx, move |_| {
                Box::new(RecordingRenderer(Arc::clone(&state_for_factory)))
            });
        });

        bus.emit(Event::new(WORKFLOW_START, "backup", job));
        bus.emit(Event::new("snapshot.commit", "backup", job));
        bus.emit(Event::new(WORKFLOW_END, "backup", job));
        drop(bus);
        handle.join().unwrap();

        let state = state.lock().unwrap();
        assert_eq!(
            state.seen,
            vec!["workflow.start", "snapshot.commit", "workflow.end"]
        );
        assert!(state.finished);
    }

    #[test]
    fn events_without_live_renderer_are_ignored() {
        let (bus, rx) = EventBus::new();
        let state = Arc::new(Mutex::new(RecordingState::default()));

        let state_for_factory = Arc::clone(&state);
        let handle = std::thread::spawn(move || {
            dispatch(rx, move |_| {
                Box::new(RecordingRenderer(Arc::clone(&state_for_factory)))
            });
        });

        // No workflow.start: nothing should be recorded.
        bus.emit(Event::new("snapshot.commit", "backup", Uuid::from_u128(2)));
        drop(bus);
        handle.join().unwrap();

        assert!(state.lock().unwrap().seen.is_empty());
    }

    #[test]
    fn end_for_different_job_does_not_tear_down() {
        let (bus, rx) = EventBus::new();
        let state = Arc::new(Mutex::new(RecordingState::default()));

        let state_for_factory = Arc::clone(&state);
        let handle = std::thread::spawn(move || {
            dispatch(rx, move |_| {
                Box::new(RecordingRenderer(Arc::clone(&state_for_factory)))
            });
        });

        let job_a = Uuid::from_u128(1);
        let job_b = Uuid::from_u128(2);
        bus.emit(Event::new(WORKFLOW_START, "backup", job_a));
        bus.emit(Event::new(WORKFLOW_END, "backup", job_b)); // ignored teardown
        bus.emit(Event::new("still.alive", "backup", job_a));
        drop(bus);
        handle.join().unwrap();

        let state = state.lock().unwrap();
        assert!(state.seen.contains(&"still.alive".to_string()));
    }

    #[test]
    fn emit_never_blocks_when_full() {
        let (bus, _rx) = EventBus::new();
        // Nobody consumes; fill past capacity.
        for i in 0..(BUS_CAPACITY + 10) {
            bus.emit(Event::new("tick", "w", Uuid::from_u128(i as u128)));
        }
        assert!(bus.dropped() >= 10);
    }
}
