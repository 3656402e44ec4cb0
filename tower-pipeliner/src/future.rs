//! Future types for the `Pipeliner` middleware.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures_core::ready;
use pin_project::pin_project;

use super::{error::PipelineError, message};

/// Future that completes when the batch containing the submitted item completes.
#[pin_project]
#[derive(Debug)]
pub struct ResponseFuture {
    #[pin]
    state: ResponseState,
}

#[pin_project(project = ResponseStateProj)]
#[derive(Debug)]
enum ResponseState {
    Failed(Option<PipelineError>),
    Rx(#[pin] message::Rx),
}

impl ResponseFuture {
    pub(crate) fn new(rx: message::Rx) -> Self {
        ResponseFuture {
            state: ResponseState::Rx(rx),
        }
    }

    pub(crate) fn failed(err: PipelineError) -> Self {
        ResponseFuture {
            state: ResponseState::Failed(Some(err)),
        }
    }
}

impl Future for ResponseFuture {
    type Output = Result<(), PipelineError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match this.state.project() {
            ResponseStateProj::Failed(e) => {
                Poll::Ready(Err(e.take().expect("polled after error")))
            }
            ResponseStateProj::Rx(rx) => match ready!(rx.poll(cx)) {
                Ok(result) => Poll::Ready(result),
                // The worker or batch task dropped the result slot without sending a result.
                Err(_) => Poll::Ready(Err(PipelineError::Closed)),
            },
        }
    }
}
