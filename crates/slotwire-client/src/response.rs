//! Awaitable handle for one request.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use slotwire_protocol::Wire;

use crate::error::CallError;
use crate::slots::SlotTable;

enum State {
    /// Resolved without touching a slot (overflow, unknown type).
    Failed(CallError),
    Waiting { slots: Arc<SlotTable>, id: u32 },
    Done,
}

/// Resolves with the response to a request sent by
/// [`Client::send_request`](crate::Client::send_request).
///
/// Dropping the future before it resolves abandons the request: its slot is
/// freed once the response (or the connection's end) arrives, and the
/// response is discarded.
#[must_use = "a request's slot stays occupied until its response arrives"]
pub struct ResponseFuture<T> {
    state: State,
    _response: PhantomData<fn() -> T>,
}

impl<T> ResponseFuture<T> {
    pub(crate) fn failed(error: CallError) -> Self {
        Self {
            state: State::Failed(error),
            _response: PhantomData,
        }
    }

    pub(crate) fn waiting(slots: Arc<SlotTable>, id: u32) -> Self {
        Self {
            state: State::Waiting { slots, id },
            _response: PhantomData,
        }
    }

    /// Wire id of the request, if it got a slot.
    pub fn request_id(&self) -> Option<u32> {
        match self.state {
            State::Waiting { id, .. } => Some(id),
            _ => None,
        }
    }
}

impl<T: Wire> Future for ResponseFuture<T> {
    type Output = Result<T, CallError>;

    /// Polling again after completion yields `InternalError`.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outcome = match &this.state {
            State::Failed(error) => Err(*error),
            State::Waiting { slots, id } => match slots.get(*id) {
                Some(slot) => match slot.poll_outcome(cx) {
                    Poll::Ready(outcome) => outcome,
                    Poll::Pending => return Poll::Pending,
                },
                None => Err(CallError::InternalError),
            },
            State::Done => Err(CallError::InternalError),
        };
        this.state = State::Done;

        // The slot checked the response kind against `T` on delivery.
        Poll::Ready(outcome.and_then(|message| {
            message
                .downcast::<T>()
                .map(|response| *response)
                .map_err(|_| CallError::InternalError)
        }))
    }
}

impl<T> Drop for ResponseFuture<T> {
    fn drop(&mut self) {
        if let State::Waiting { slots, id } = &self.state
            && let Some(slot) = slots.get(*id)
        {
            slot.disarm();
        }
    }
}

impl<T> std::fmt::Debug for ResponseFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            State::Failed(error) => format!("failed ({error})"),
            State::Waiting { id, .. } => format!("waiting on slot {id}"),
            State::Done => "done".to_string(),
        };
        f.debug_struct("ResponseFuture")
            .field("state", &state)
            .finish()
    }
}
