//! The streaming response coordinator.
//!
//! `stream` spawns the reasoning cycle and hands back a [`ResponseStream`]:
//! a finite, non-restartable sequence of [`ResponseEvent`]s ending in exactly
//! one `done` or `error`. Cancelling (or dropping) the stream stops the cycle
//! at its next await point; nothing partial is persisted.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use juris_core::session::SessionId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::event::{EventSink, ResponseEvent};
use crate::orchestrator::{CycleError, CycleOutcome, Orchestrator};
use crate::prompt::FALLBACK_MESSAGE;

/// A user utterance sent by the chat UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Relays orchestrator events to callers.
#[derive(Clone)]
pub struct StreamCoordinator {
    orchestrator: Arc<Orchestrator>,
    buffer: usize,
}

impl StreamCoordinator {
    pub fn new(orchestrator: Arc<Orchestrator>, buffer: usize) -> Self {
        Self {
            orchestrator,
            buffer: buffer.max(1),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Start answering `request` and stream the events.
    pub fn stream(&self, session_id: SessionId, request: ChatRequest) -> ResponseStream {
        let (tx, rx) = mpsc::channel(self.buffer);
        let cancel = CancellationToken::new();
        let orchestrator = self.orchestrator.clone();
        let token = cancel.clone();

        tokio::spawn(async move {
            let sink = EventSink::new(tx);
            let result = orchestrator
                .respond(&session_id, &request.message, &sink, &token)
                .await;
            sink.finish(&result).await;
        });

        ResponseStream {
            rx,
            cancel,
            finished: false,
        }
    }

    /// Answer without streaming.
    pub async fn ask(
        &self,
        session_id: &SessionId,
        request: &ChatRequest,
    ) -> Result<CycleOutcome, CycleError> {
        self.orchestrator
            .respond(
                session_id,
                &request.message,
                &EventSink::discard(),
                &CancellationToken::new(),
            )
            .await
    }
}

/// Events of one in-flight request.
///
/// Dropping the stream cancels the request.
pub struct ResponseStream {
    rx: mpsc::Receiver<ResponseEvent>,
    cancel: CancellationToken,
    finished: bool,
}

impl ResponseStream {
    /// Stop the request at its next safe point. The stream still ends with
    /// a terminal event.
    pub fn cancel(&self) {
        debug!("Response stream cancelled by caller");
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Stream for ResponseStream {
    type Item = ResponseEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                this.finished = event.is_terminal();
                Poll::Ready(Some(event))
            }
            // The cycle ended without a terminal event (its task died).
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(Some(ResponseEvent::Error {
                    message: FALLBACK_MESSAGE.into(),
                }))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
