//! Live event stream handed out by [`crate::ChainClient::subscribe`].
//!
//! Consume it through its [`futures::Stream`] API. Dropping it unsubscribes.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use tokio::sync::mpsc;
use vrelay_types::LoggedEvent;

#[derive(Debug)]
pub struct EventSubscription {
    receiver: mpsc::UnboundedReceiver<LoggedEvent>,
}

impl EventSubscription {
    pub(crate) fn from_receiver(receiver: mpsc::UnboundedReceiver<LoggedEvent>) -> Self {
        Self { receiver }
    }

    /// Next event, or `None` once the chain side has gone away.
    pub async fn recv(&mut self) -> Option<LoggedEvent> {
        self.receiver.recv().await
    }
}

impl futures::Stream for EventSubscription {
    type Item = LoggedEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}
