use tokio::sync::broadcast;

use triage_types::EngineEvent;

/// Fan-out of turn progress to front ends: assistant prose (`message.prose`),
/// per-call `tool.started` / `tool.completed` / `tool.failed`, `loop.stopped`
/// and `provider.retry`. Publishing never blocks a turn; with no subscribers
/// events are dropped, and a slow subscriber sees `Lagged` instead.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
