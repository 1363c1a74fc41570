//! Pause/resume for the hash pipeline, scoped to a stack-allocated handle
//! "while paused, workers block but keep queue position".

use std::sync::Arc;

use tokio::sync::watch;

/// A cloneable handle shared between whoever requests a pause and the
/// pipeline worker that checks it between jobs.
#[derive(Clone)]
pub struct Pauser {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Pauser {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Requests a pause and returns a guard; dropping the guard resumes the
    /// pipeline, making the pause scoped to the guard's lifetime the way a
    /// stack-allocated pauser handle would in the original.
    pub fn pause(&self) -> PauseHandle {
        let _ = self.tx.broadcast(true);
        PauseHandle {
            tx: Arc::clone(&self.tx),
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.rx.borrow()
    }

    /// Blocks (without losing queue position, since the caller still holds
    /// the job it was about to process) until no pause is in effect.
    pub async fn wait_if_paused(&mut self) {
        while *self.rx.borrow() {
            if self.rx.recv().await.is_none() {
                break;
            }
        }
    }
}

impl Default for Pauser {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard representing one outstanding pause request. The pipeline
/// resumes once the handle is dropped.
pub struct PauseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Drop for PauseHandle {
    fn drop(&mut self) {
        let _ = self.tx.broadcast(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pause_then_drop_resumes() {
        let pauser = Pauser::new();
        assert!(!pauser.is_paused());
        let handle = pauser.pause();
        assert!(pauser.is_paused());
        drop(handle);
        assert!(!pauser.is_paused());
    }
}
