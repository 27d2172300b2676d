//! Async front for the engine.
//!
//! The engine does blocking SQLite I/O, so it lives on a dedicated blocking
//! thread and serves commands from a bounded queue one at a time. Callers get
//! replies over oneshot channels and can watch the operational state.

use haven_types::OperationalState;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::{
    CheckpointOutcome, Engine, EngineError, NavigationOutcome, NavigationRequest, ServiceError,
};

const COMMAND_QUEUE_CAPACITY: usize = 64;

enum Command {
    Navigate {
        request: NavigationRequest,
        reply: oneshot::Sender<NavigationOutcome>,
    },
    Checkpoint {
        payload: Value,
        reply: oneshot::Sender<Result<CheckpointOutcome, EngineError>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

pub struct NavigationService {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<OperationalState>,
    worker: JoinHandle<()>,
}

impl NavigationService {
    /// Move `engine` onto a blocking worker. Must be called inside a Tokio runtime.
    ///
    /// Dropping the service without [`shutdown`](Self::shutdown) stops the
    /// worker but leaves no clean-shutdown marker, so the next open resumes.
    #[must_use]
    pub fn spawn(engine: Engine) -> Self {
        let (commands, queue) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (state_tx, state) = watch::channel(engine.state().clone());
        let worker = tokio::task::spawn_blocking(move || serve(engine, queue, &state_tx));
        Self {
            commands,
            state,
            worker,
        }
    }

    pub async fn request(
        &self,
        request: NavigationRequest,
    ) -> Result<NavigationOutcome, ServiceError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Navigate { request, reply }).await?;
        response.await.map_err(|_| ServiceError::Closed)
    }

    pub async fn checkpoint(&self, payload: Value) -> Result<CheckpointOutcome, ServiceError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Checkpoint { payload, reply }).await?;
        Ok(response.await.map_err(|_| ServiceError::Closed)??)
    }

    /// Receiver that sees every committed state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<OperationalState> {
        self.state.clone()
    }

    #[must_use]
    pub fn current(&self) -> OperationalState {
        self.state.borrow().clone()
    }

    /// Record a clean shutdown and wait for the worker to exit.
    pub async fn shutdown(self) -> Result<(), ServiceError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        let result = response.await.map_err(|_| ServiceError::Closed)?;
        if let Err(err) = self.worker.await {
            tracing::warn!("Navigation worker did not exit cleanly: {err}");
        }
        Ok(result?)
    }

    async fn send(&self, command: Command) -> Result<(), ServiceError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ServiceError::Closed)
    }
}

fn serve(
    mut engine: Engine,
    mut queue: mpsc::Receiver<Command>,
    state: &watch::Sender<OperationalState>,
) {
    while let Some(command) = queue.blocking_recv() {
        match command {
            Command::Navigate { request, reply } => {
                let outcome = engine.request_transition(&request);
                if outcome.is_approved() {
                    state.send_replace(engine.state().clone());
                }
                let _ = reply.send(outcome);
            }
            Command::Checkpoint { payload, reply } => {
                let _ = reply.send(engine.checkpoint(payload));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(engine.shutdown());
                return;
            }
        }
    }
    tracing::debug!("Navigation service dropped without shutdown");
}
