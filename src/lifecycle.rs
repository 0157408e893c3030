use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Pause/resume control exposed by a long-running task.
///
/// Pausing is not cancellation: the task finishes the iteration it is in
/// and parks at its next loop boundary until resumed.
pub trait TaskLifecycle: Send + Sync {
    fn name(&self) -> &'static str;
    fn pause(&self);
    fn resume(&self);
    fn is_paused(&self) -> bool;
}

/// Pause gate shared between a task and whoever controls it.
#[derive(Debug, Clone)]
pub struct TaskGate {
    name: &'static str,
    paused: Arc<watch::Sender<bool>>,
}

impl TaskGate {
    pub fn new(name: &'static str) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            name,
            paused: Arc::new(paused),
        }
    }

    /// Returns immediately when running, otherwise waits for `resume`.
    pub async fn checkpoint(&self) {
        let mut rx = self.paused.subscribe();
        if !*rx.borrow_and_update() {
            return;
        }
        debug!(task = self.name, "Task parked");
        // The sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|paused| !*paused).await;
        debug!(task = self.name, "Task resumed");
    }
}

impl TaskLifecycle for TaskGate {
    fn name(&self) -> &'static str {
        self.name
    }

    fn pause(&self) {
        self.paused.send_replace(true);
    }

    fn resume(&self) {
        self.paused.send_replace(false);
    }

    fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_checkpoint_passes_when_running() {
        let gate = TaskGate::new("sensor");
        tokio::time::timeout(Duration::from_millis(50), gate.checkpoint())
            .await
            .expect("running gate does not block");
    }

    #[tokio::test]
    async fn test_checkpoint_waits_for_resume() {
        let gate = TaskGate::new("telemetry");
        gate.pause();
        assert!(gate.is_paused());

        let parked = tokio::time::timeout(Duration::from_millis(30), gate.checkpoint()).await;
        assert!(parked.is_err());

        let controller = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            controller.resume();
        });

        tokio::time::timeout(Duration::from_secs(2), gate.checkpoint())
            .await
            .expect("resume releases the gate");
        assert!(!gate.is_paused());
    }
}
