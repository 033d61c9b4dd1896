//! An in-memory [`FramedConnection`] test double.
//!
//! Grounded in `prose-core-client`'s `test-connector.rs` pattern from the
//! retrieval pack: a cheaply-clonable handle backed by shared state, with a
//! stanza handler callback that can synthesize replies, plus a record of
//! everything sent so assertions can inspect it after the fact.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::{Sink, Stream};
use minidom::Element;

use crate::connection::{ConnectionError, FramedConnection, InboundEvent, OutboundItem};

/// A handler that inspects an outbound stanza/element and optionally
/// synthesizes inbound events in response (e.g. an IQ result).
pub type ReplyHandler = dyn FnMut(&OutboundItem) -> Vec<InboundEvent> + Send;

#[derive(Default)]
struct Inner {
    inbound: VecDeque<Result<InboundEvent, ConnectionError>>,
    outbound: Vec<OutboundItem>,
    reset_count: usize,
    reset_to: Option<String>,
    next_id: u64,
    waker: Option<std::task::Waker>,
    reply_handler: Option<Box<ReplyHandler>>,
}

/// A cloneable handle to an in-memory test connection.
///
/// Every clone shares the same queue: push inbound events with
/// [`push_inbound`](TestConnection::push_inbound) from outside the porter's
/// run loop, and inspect [`sent`](TestConnection::sent) afterwards.
#[derive(Clone)]
pub struct TestConnection {
    inner: Arc<Mutex<Inner>>,
}

impl Default for TestConnection {
    fn default() -> Self {
        TestConnection { inner: Arc::new(Mutex::new(Inner::default())) }
    }
}

impl TestConnection {
    /// Builds a fresh, empty test connection.
    pub fn new() -> Self {
        TestConnection::default()
    }

    /// Installs a handler invoked synchronously for every outbound item,
    /// whose returned events are queued as if the peer had sent them back.
    pub fn on_send(&self, handler: impl FnMut(&OutboundItem) -> Vec<InboundEvent> + Send + 'static) {
        self.inner.lock().expect("test connection mutex poisoned").reply_handler = Some(Box::new(handler));
    }

    /// Queues an inbound event as if it had just arrived off the wire.
    pub fn push_inbound(&self, event: InboundEvent) {
        let mut inner = self.inner.lock().expect("test connection mutex poisoned");
        inner.inbound.push_back(Ok(event));
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
    }

    /// Queues an inbound read failure as if the transport had broken.
    pub fn push_error(&self, error: ConnectionError) {
        let mut inner = self.inner.lock().expect("test connection mutex poisoned");
        inner.inbound.push_back(Err(error));
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
    }

    /// Queues a stanza, convenience wrapper around [`push_inbound`](Self::push_inbound).
    pub fn push_stanza(&self, element: Element) {
        let stanza = crate::stanza::Stanza::from_element(element).expect("test fixture must be a valid stanza");
        self.push_inbound(InboundEvent::Stanza(stanza));
    }

    /// Returns every item sent so far, in order.
    pub fn sent(&self) -> Vec<OutboundItem> {
        let inner = self.inner.lock().expect("test connection mutex poisoned");
        inner
            .outbound
            .iter()
            .map(|item| match item {
                OutboundItem::Stanza(s) => OutboundItem::Stanza(s.clone()),
                OutboundItem::Raw(e) => OutboundItem::Raw(e.clone()),
                OutboundItem::Close => OutboundItem::Close,
            })
            .collect()
    }

    /// Number of times [`FramedConnection::reset_stream`] has been called.
    pub fn reset_count(&self) -> usize {
        self.inner.lock().expect("test connection mutex poisoned").reset_count
    }

    /// The `to` the stream was last reopened against, if any.
    pub fn reset_to(&self) -> Option<String> {
        self.inner.lock().expect("test connection mutex poisoned").reset_to.clone()
    }
}

impl Stream for TestConnection {
    type Item = Result<InboundEvent, ConnectionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut inner = self.inner.lock().expect("test connection mutex poisoned");
        match inner.inbound.pop_front() {
            Some(item) => Poll::Ready(Some(item)),
            None => {
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Sink<OutboundItem> for TestConnection {
    type Error = ConnectionError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: OutboundItem) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().expect("test connection mutex poisoned");
        let synthesized = inner.reply_handler.as_mut().map(|handler| handler(&item));
        inner.outbound.push(item);
        if let Some(events) = synthesized {
            for event in events {
                inner.inbound.push_back(Ok(event));
            }
            if let Some(waker) = inner.waker.take() {
                waker.wake();
            }
        }
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

impl FramedConnection for TestConnection {
    fn reset_stream(&mut self, to: &str) {
        let mut inner = self.inner.lock().expect("test connection mutex poisoned");
        inner.reset_count += 1;
        inner.reset_to = Some(to.to_string());
    }

    fn new_id(&mut self) -> String {
        let mut inner = self.inner.lock().expect("test connection mutex poisoned");
        inner.next_id += 1;
        format!("test-{}", inner.next_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};

    #[tokio::test]
    async fn pushed_inbound_events_are_observed_in_order() {
        let mut conn = TestConnection::new();
        conn.push_inbound(InboundEvent::StreamClose);
        let event = conn.next().await.unwrap().unwrap();
        assert!(matches!(event, InboundEvent::StreamClose));
    }

    #[tokio::test]
    async fn sent_items_are_recorded() {
        let mut conn = TestConnection::new();
        conn.send(OutboundItem::Close).await.unwrap();
        assert!(matches!(conn.sent().as_slice(), [OutboundItem::Close]));
    }

    #[tokio::test]
    async fn reply_handler_synthesizes_inbound_events() {
        let conn = TestConnection::new();
        conn.on_send(|_item| vec![InboundEvent::StreamClose]);
        let mut writer = conn.clone();
        writer.send(OutboundItem::Close).await.unwrap();
        let mut reader = conn.clone();
        let event = reader.next().await.unwrap().unwrap();
        assert!(matches!(event, InboundEvent::StreamClose));
    }

    #[test]
    fn new_id_is_deterministic_and_distinct() {
        let mut conn = TestConnection::new();
        assert_eq!(conn.new_id(), "test-1");
        assert_eq!(conn.new_id(), "test-2");
    }
}
