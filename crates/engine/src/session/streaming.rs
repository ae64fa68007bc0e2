// Push side of one agent edit stream into one resource.
//
// Batches are queued without blocking and applied in order by a worker task
// that holds the resource's stream lock for the life of the stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rewind_common::notebook::CellEdit;
use rewind_common::text::TextEdit;
use rewind_common::types::TelemetryInfo;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use url::Url;

use super::entry::AgentEdits;
use super::sequencer::ThrottledSequencer;
use super::ChatEditingSession;

enum StreamMessage {
    Edits { resource: Url, edits: AgentEdits, is_last: bool },
    Complete,
}

type QueuedMessage = (Duration, StreamMessage);

pub struct StreamingEditsHandle {
    resource: Url,
    sender: mpsc::UnboundedSender<QueuedMessage>,
    sequencer: ThrottledSequencer,
    did_complete: AtomicBool,
    completion: oneshot::Receiver<()>,
}

impl StreamingEditsHandle {
    pub fn resource(&self) -> &Url {
        &self.resource
    }

    fn queue(&self, message: StreamMessage) {
        let delay = self.sequencer.admit();
        if self.sender.send((delay, message)).is_err() {
            self.sequencer.finish();
            debug!(uri = %self.resource, "edit stream already closed");
        }
    }

    pub fn push_text(&self, edits: Vec<TextEdit>, is_last: bool) {
        self.queue(StreamMessage::Edits {
            resource: self.resource.clone(),
            edits: AgentEdits::Text(edits),
            is_last,
        });
    }

    /// Text edits addressed to one cell of the notebook this stream edits.
    pub fn push_notebook_cell_text(&self, cell: &Url, edits: Vec<TextEdit>, is_last: bool) {
        self.queue(StreamMessage::Edits {
            resource: cell.clone(),
            edits: AgentEdits::Text(edits),
            is_last,
        });
    }

    pub fn push_notebook(&self, edits: Vec<CellEdit>, is_last: bool) {
        self.queue(StreamMessage::Edits {
            resource: self.resource.clone(),
            edits: AgentEdits::Notebook(edits),
            is_last,
        });
    }

    /// Ends the stream. Later calls are ignored.
    pub fn complete(&self) {
        if self.did_complete.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue(StreamMessage::Complete);
    }

    /// Waits for the worker to drain. True when `complete` was processed,
    /// false when the stream ended without it (never completed, or the
    /// session was disposed first).
    pub async fn finished(self) -> bool {
        let Self { sender, completion, .. } = self;
        drop(sender);
        completion.await.is_ok()
    }
}

impl ChatEditingSession {
    /// Opens an edit stream into `resource` for the request in `response`.
    ///
    /// Streams into the same resource run one after another in the order
    /// their workers first reach the resource lock, and share one throttle.
    pub fn start_streaming_edits(
        &self,
        resource: &Url,
        response: &TelemetryInfo,
        undo_stop: Option<&str>,
    ) -> StreamingEditsHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (done, completion) = oneshot::channel();
        let sequencer = self.stream_sequencer(resource);

        let worker = StreamWorker {
            session: self.clone(),
            resource: resource.clone(),
            response: response.clone(),
            undo_stop: undo_stop.map(str::to_string),
            sequencer: sequencer.clone(),
            done: Some(done),
        };
        tokio::spawn(worker.run(receiver));

        StreamingEditsHandle {
            resource: resource.clone(),
            sender,
            sequencer,
            did_complete: AtomicBool::new(false),
            completion,
        }
    }
}

struct StreamWorker {
    session: ChatEditingSession,
    resource: Url,
    response: TelemetryInfo,
    undo_stop: Option<String>,
    sequencer: ThrottledSequencer,
    done: Option<oneshot::Sender<()>>,
}

impl StreamWorker {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<QueuedMessage>) {
        let inner = self.session.inner.clone();
        // A stream queued behind another must not hold the baseline lock
        // while it waits.
        let _stream_guard = inner.streaming_locks.lock(self.resource.to_string()).await;
        let baseline_guard = inner.baseline_locks.lock(self.resource.path()).await;

        self.session.wait_ready().await;
        if !self.session.is_disposed() {
            if let Err(err) = self
                .session
                .accept_streaming_edits_start(&self.response, self.undo_stop.as_deref(), &self.resource)
                .await
            {
                warn!(uri = %self.resource, error = %err, "failed to start edit stream");
            }
        }
        drop(baseline_guard);

        while let Some((delay, message)) = receiver.recv().await {
            let is_complete = matches!(message, StreamMessage::Complete);
            tokio::join!(self.process(message), tokio::time::sleep(delay));
            self.sequencer.finish();
            if is_complete {
                break;
            }
        }
        debug!(uri = %self.resource, request_id = %self.response.request_id, "edit stream closed");
    }

    async fn process(&mut self, message: StreamMessage) {
        if self.session.is_disposed() {
            return;
        }
        match message {
            StreamMessage::Edits { resource, edits, is_last } => {
                if let Err(err) =
                    self.session.accept_edits(&resource, &edits, is_last, &self.response).await
                {
                    warn!(uri = %resource, error = %err, "failed to apply streamed edits");
                }
            }
            StreamMessage::Complete => {
                let flush = AgentEdits::Text(Vec::new());
                if let Err(err) =
                    self.session.accept_edits(&self.resource, &flush, true, &self.response).await
                {
                    warn!(uri = %self.resource, error = %err, "failed to finish edit stream");
                }
                self.session
                    .resolve(&self.response.request_id, self.undo_stop.as_deref(), &self.resource)
                    .await;
                if let Some(done) = self.done.take() {
                    let _ = done.send(());
                }
            }
        }
    }
}
