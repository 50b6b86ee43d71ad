use std::{
    panic::{self, AssertUnwindSafe},
    thread,
};

use flume::{Receiver, Sender, TrySendError};
use thiserror::Error;

use crate::{Completion, Generator, InferenceError, Model};

/// A prompt waiting for the worker, with the channel its result goes back on.
struct InferenceRequest {
    prompt: String,
    tx_completion: Sender<Result<Completion, WorkerError>>,
}

#[derive(Error, Debug)]
/// Errors encountered while handing a request to the [InferenceWorker].
pub enum WorkerError {
    #[error("the inference queue is full")]
    /// Too many requests are already waiting.
    Busy,
    #[error("the inference worker has stopped")]
    /// The worker thread is gone.
    Stopped,
    #[error("generation panicked: {0}")]
    /// Generation for this request panicked. The worker carries on with the next request.
    Panicked(String),
    #[error("{0}")]
    /// Generation failed.
    Inference(#[from] InferenceError),
}

/// Runs generation requests one at a time on a dedicated thread.
///
/// The worker owns the [Generator] (and therefore the model). Requests are queued in
/// arrival order on a bounded channel; when the queue is full, new requests are
/// rejected with [WorkerError::Busy] instead of waiting.
pub struct InferenceWorker;
impl InferenceWorker {
    /// Moves `generator` onto a new thread and returns a handle for submitting prompts.
    ///
    /// At most `queue_capacity` requests wait while another one is being generated.
    /// The thread exits once every [WorkerHandle] has been dropped.
    pub fn spawn<M: Model + 'static>(
        generator: Generator<M>,
        queue_capacity: usize,
    ) -> std::io::Result<WorkerHandle> {
        let (tx, rx) = flume::bounded(queue_capacity);
        thread::Builder::new()
            .name("inference".into())
            .spawn(move || run(&generator, rx))?;
        Ok(WorkerHandle { tx })
    }
}

fn run<M: Model>(generator: &Generator<M>, rx: Receiver<InferenceRequest>) {
    log::debug!("inference worker started");
    for request in rx.iter() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            generator.generate(&request.prompt, |_| {})
        }));
        let result = match result {
            Ok(result) => result.map_err(WorkerError::from),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("generation panicked: {message}");
                Err(WorkerError::Panicked(message))
            }
        };

        if request.tx_completion.send(result).is_err() {
            // The receiver has been dropped.
            log::warn!("could not send completion, the requester went away");
        }
    }
    log::debug!("inference worker stopped");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Submits prompts to an [InferenceWorker]. Cheap to clone.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: Sender<InferenceRequest>,
}
impl WorkerHandle {
    /// Queues `prompt` for generation.
    pub fn submit(&self, prompt: String) -> Result<PendingCompletion, WorkerError> {
        let (tx_completion, rx_completion) = flume::bounded(1);
        let request = InferenceRequest {
            prompt,
            tx_completion,
        };
        match self.tx.try_send(request) {
            Ok(()) => Ok(PendingCompletion(rx_completion)),
            Err(TrySendError::Full(_)) => Err(WorkerError::Busy),
            Err(TrySendError::Disconnected(_)) => Err(WorkerError::Stopped),
        }
    }

    /// The number of requests waiting behind the one being generated.
    pub fn queued(&self) -> usize {
        self.tx.len()
    }
}

/// A submitted request whose completion has not been received yet.
pub struct PendingCompletion(Receiver<Result<Completion, WorkerError>>);
impl PendingCompletion {
    /// Waits for the completion without blocking the async runtime.
    pub async fn wait(self) -> Result<Completion, WorkerError> {
        self.0
            .recv_async()
            .await
            .unwrap_or(Err(WorkerError::Stopped))
    }

    /// Blocks the current thread until the completion arrives.
    pub fn wait_blocking(self) -> Result<Completion, WorkerError> {
        self.0.recv().unwrap_or(Err(WorkerError::Stopped))
    }
}
