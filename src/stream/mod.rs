//! Streaming boundary for external consumers.
//!
//! A [`StreamHub`] keeps one consumer registry per hook stage. Consumers of
//! the observer stages get copies of every intercepted message, best effort.
//! Consumers of the modifier stages get a [`ModExchange`] and must answer it;
//! the engine waits for that answer and applies it before going on.

pub mod message;

pub use message::{WireHeader, WireMessage};

use crate::hooks::{
    ExchangeId, HookError, HookSet, HookStage, InterceptedRequest, InterceptedResponse, Modifier,
    Observer,
};
use async_trait::async_trait;
use futures::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// A message awaiting a consumer's answer.
#[derive(Debug)]
pub struct ModExchange {
    pub message: WireMessage,
    reply: oneshot::Sender<WireMessage>,
}

impl ModExchange {
    /// Send back the (possibly edited) message. Returns `false` if the
    /// exchange is no longer waiting.
    pub fn respond(self, message: WireMessage) -> bool {
        self.reply.send(message).is_ok()
    }

    /// Answer with the message unchanged.
    pub fn pass(self) -> bool {
        let message = self.message.clone();
        self.respond(message)
    }
}

struct RegistryInner<T> {
    closing: bool,
    consumers: BTreeMap<u64, mpsc::UnboundedSender<T>>,
}

struct Registry<T> {
    stage: HookStage,
    next_id: AtomicU64,
    inner: Mutex<RegistryInner<T>>,
}

impl<T: Send + 'static> Registry<T> {
    fn new(stage: HookStage) -> Arc<Self> {
        Arc::new(Self {
            stage,
            next_id: AtomicU64::new(1),
            inner: Mutex::new(RegistryInner {
                closing: false,
                consumers: BTreeMap::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner<T>> {
        // Nothing in the critical sections can leave the map half updated
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn subscribe(self: &Arc<Self>) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut inner = self.lock();
        if !inner.closing {
            inner.consumers.insert(id, tx);
            debug!(stage = %self.stage, consumer_id = id, "Stream consumer attached");
        }

        Subscription {
            id,
            stage: self.stage,
            receiver: rx,
            registry: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) {
        if self.lock().consumers.remove(&id).is_some() {
            debug!(stage = %self.stage, consumer_id = id, "Stream consumer detached");
        }
    }

    fn len(&self) -> usize {
        self.lock().consumers.len()
    }

    fn is_empty(&self) -> bool {
        self.lock().consumers.is_empty()
    }

    fn close(&self) {
        let mut inner = self.lock();
        inner.closing = true;
        inner.consumers.clear();
    }

    fn senders(&self) -> Vec<(u64, mpsc::UnboundedSender<T>)> {
        self.lock()
            .consumers
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect()
    }
}

impl<T: Clone + Send + 'static> Registry<T> {
    /// Deliver a copy to every consumer. Consumers whose receiver is gone are dropped.
    fn broadcast(&self, message: T) -> usize {
        let mut inner = self.lock();
        if inner.closing {
            return 0;
        }

        inner.consumers.retain(|_, tx| tx.send(message.clone()).is_ok());
        inner.consumers.len()
    }
}

/// A consumer's handle on one stage. Dropping it detaches the consumer.
pub struct Subscription<T: Send + 'static> {
    id: u64,
    stage: HookStage,
    receiver: mpsc::UnboundedReceiver<T>,
    registry: std::sync::Weak<Registry<T>>,
}

impl<T: Send + 'static> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stage(&self) -> HookStage {
        self.stage
    }

    /// Next message, or `None` once the hub has been closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }
}

impl<T: Send + 'static> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.receiver.poll_recv(cx)
    }
}

impl<T: Send + 'static> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("stage", &self.stage)
            .finish()
    }
}

/// Consumer registries for the six hook stages.
pub struct StreamHub {
    request_in: Arc<Registry<WireMessage>>,
    request_mod: Arc<Registry<ModExchange>>,
    request_out: Arc<Registry<WireMessage>>,
    response_in: Arc<Registry<WireMessage>>,
    response_mod: Arc<Registry<ModExchange>>,
    response_out: Arc<Registry<WireMessage>>,
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamHub {
    pub fn new() -> Self {
        Self {
            request_in: Registry::new(HookStage::RequestIn),
            request_mod: Registry::new(HookStage::RequestMod),
            request_out: Registry::new(HookStage::RequestOut),
            response_in: Registry::new(HookStage::ResponseIn),
            response_mod: Registry::new(HookStage::ResponseMod),
            response_out: Registry::new(HookStage::ResponseOut),
        }
    }

    pub fn requests_in(&self) -> Subscription<WireMessage> {
        self.request_in.subscribe()
    }

    pub fn requests_mod(&self) -> Subscription<ModExchange> {
        self.request_mod.subscribe()
    }

    pub fn requests_out(&self) -> Subscription<WireMessage> {
        self.request_out.subscribe()
    }

    pub fn responses_in(&self) -> Subscription<WireMessage> {
        self.response_in.subscribe()
    }

    pub fn responses_mod(&self) -> Subscription<ModExchange> {
        self.response_mod.subscribe()
    }

    pub fn responses_out(&self) -> Subscription<WireMessage> {
        self.response_out.subscribe()
    }

    pub fn consumer_count(&self, stage: HookStage) -> usize {
        match stage {
            HookStage::RequestIn => self.request_in.len(),
            HookStage::RequestMod => self.request_mod.len(),
            HookStage::RequestOut => self.request_out.len(),
            HookStage::ResponseIn => self.response_in.len(),
            HookStage::ResponseMod => self.response_mod.len(),
            HookStage::ResponseOut => self.response_out.len(),
        }
    }

    /// Detach every consumer and refuse new ones. Open subscriptions see end of stream.
    pub fn close(&self) {
        self.request_in.close();
        self.request_mod.close();
        self.request_out.close();
        self.response_in.close();
        self.response_mod.close();
        self.response_out.close();
    }

    /// `hooks` with this hub attached to all six stages.
    pub fn attach(&self, hooks: &HookSet) -> HookSet {
        hooks
            .with_request_in(Arc::new(StreamObserver(self.request_in.clone())))
            .with_request_mod(Arc::new(StreamModifier(self.request_mod.clone())))
            .with_request_out(Arc::new(StreamObserver(self.request_out.clone())))
            .with_response_in(Arc::new(StreamObserver(self.response_in.clone())))
            .with_response_mod(Arc::new(StreamModifier(self.response_mod.clone())))
            .with_response_out(Arc::new(StreamObserver(self.response_out.clone())))
    }
}

impl std::fmt::Debug for StreamHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for stage in HookStage::ALL {
            map.entry(&stage.as_str(), &self.consumer_count(stage));
        }
        map.finish()
    }
}

struct StreamObserver(Arc<Registry<WireMessage>>);

impl StreamObserver {
    fn publish(&self, message: WireMessage, id: ExchangeId) {
        let delivered = self.0.broadcast(message);
        debug!(stage = %self.0.stage, exchange_id = %id, delivered, "Published to stream consumers");
    }
}

#[async_trait]
impl Observer<InterceptedRequest> for StreamObserver {
    async fn observe(&self, request: InterceptedRequest, id: ExchangeId) -> Result<(), HookError> {
        if self.0.is_empty() {
            return Ok(());
        }
        let message = WireMessage::from_request(&request, id).await?;
        self.publish(message, id);
        Ok(())
    }
}

#[async_trait]
impl Observer<InterceptedResponse> for StreamObserver {
    async fn observe(&self, response: InterceptedResponse, id: ExchangeId) -> Result<(), HookError> {
        if self.0.is_empty() {
            return Ok(());
        }
        let message = WireMessage::from_response(&response, id).await?;
        self.publish(message, id);
        Ok(())
    }
}

struct StreamModifier(Arc<Registry<ModExchange>>);

impl StreamModifier {
    /// Pass `message` through every consumer in attach order, each one
    /// seeing the previous answer. `None` if nobody answered.
    async fn round_trip(&self, mut message: WireMessage, id: ExchangeId) -> Option<WireMessage> {
        let mut answered = false;

        for (consumer_id, tx) in self.0.senders() {
            let (reply, answer) = oneshot::channel();
            let exchange = ModExchange {
                message: message.clone(),
                reply,
            };

            if tx.send(exchange).is_err() {
                self.0.remove(consumer_id);
                continue;
            }

            match answer.await {
                Ok(edited) => {
                    message = edited;
                    answered = true;
                }
                Err(_) => {
                    warn!(
                        stage = %self.0.stage,
                        exchange_id = %id,
                        consumer_id,
                        "Stream consumer dropped an exchange without answering"
                    );
                }
            }
        }

        answered.then_some(message)
    }
}

#[async_trait]
impl Modifier<InterceptedRequest> for StreamModifier {
    async fn modify(&self, request: &mut InterceptedRequest, id: ExchangeId) -> Result<(), HookError> {
        if self.0.is_empty() {
            return Ok(());
        }
        let message = WireMessage::from_request(request, id).await?;
        match self.round_trip(message, id).await {
            Some(edited) => edited.apply_to_request(request),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Modifier<InterceptedResponse> for StreamModifier {
    async fn modify(&self, response: &mut InterceptedResponse, id: ExchangeId) -> Result<(), HookError> {
        if self.0.is_empty() {
            return Ok(());
        }
        let message = WireMessage::from_response(response, id).await?;
        match self.round_trip(message, id).await {
            Some(edited) => edited.apply_to_response(response),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{run_request_hooks, run_response_hooks};
    use bytes::Bytes;
    use futures::StreamExt;
    use http::{Method, StatusCode, Uri};
    use std::time::Duration;
    use tokio::time::timeout;

    fn request() -> InterceptedRequest {
        InterceptedRequest::new(Method::GET, Uri::from_static("https://example.com/page")).with_body("hello")
    }

    #[tokio::test]
    async fn test_observer_consumers_get_copies() {
        let hub = StreamHub::new();
        let hooks = hub.attach(&HookSet::new());
        let mut first = hub.requests_in();
        let mut second = hub.requests_in();

        let id = ExchangeId::new();
        let mut req = request();
        run_request_hooks(&hooks, &mut req, id).await.unwrap();

        for sub in [&mut first, &mut second] {
            let message = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
            assert_eq!(message.id, id.to_string());
            assert_eq!(message.url, "https://example.com/page");
            assert_eq!(message.body, b"hello");
        }
    }

    #[tokio::test]
    async fn test_dropped_subscription_detaches() {
        let hub = StreamHub::new();
        let sub = hub.responses_out();
        assert_eq!(hub.consumer_count(HookStage::ResponseOut), 1);

        drop(sub);
        assert_eq!(hub.consumer_count(HookStage::ResponseOut), 0);
    }

    #[tokio::test]
    async fn test_mod_consumer_edits_request() {
        let hub = StreamHub::new();
        let hooks = hub.attach(&HookSet::new());
        let mut sub = hub.requests_mod();

        tokio::spawn(async move {
            while let Some(exchange) = sub.next().await {
                let mut message = exchange.message.clone();
                message.url = "https://example.com/rewritten".to_string();
                message.body = b"edited".to_vec();
                message.headers.push(WireHeader {
                    name: "x-stream".to_string(),
                    value: "1".to_string(),
                });
                exchange.respond(message);
            }
        });

        let mut req = request();
        run_request_hooks(&hooks, &mut req, ExchangeId::new()).await.unwrap();

        assert_eq!(req.uri.path(), "/rewritten");
        assert_eq!(req.headers.get("x-stream").unwrap(), "1");
        assert_eq!(req.body.bytes().await.unwrap(), Bytes::from("edited"));
    }

    #[tokio::test]
    async fn test_mod_consumer_edits_response_status() {
        let hub = StreamHub::new();
        let hooks = hub.attach(&HookSet::new());
        let mut sub = hub.responses_mod();

        tokio::spawn(async move {
            if let Some(exchange) = sub.recv().await {
                let mut message = exchange.message.clone();
                message.status = Some(418);
                exchange.respond(message);
            }
        });

        let mut response = InterceptedResponse::new(StatusCode::OK).with_body("ok");
        run_response_hooks(&hooks, &mut response, ExchangeId::new()).await.unwrap();

        assert_eq!(response.status, StatusCode::IM_A_TEAPOT);
    }

    #[tokio::test]
    async fn test_vanished_mod_consumer_is_skipped() {
        let hub = StreamHub::new();
        let hooks = hub.attach(&HookSet::new());
        let mut sub = hub.requests_mod();

        tokio::spawn(async move {
            // Take the exchange and drop it unanswered
            let _ = sub.recv().await;
        });

        let mut req = request();
        timeout(Duration::from_secs(1), run_request_hooks(&hooks, &mut req, ExchangeId::new()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(req.uri.path(), "/page");
        assert_eq!(req.body.bytes().await.unwrap(), Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_mod_without_consumers_is_noop() {
        let hub = StreamHub::new();
        let hooks = hub.attach(&HookSet::new());

        let mut req = request();
        run_request_hooks(&hooks, &mut req, ExchangeId::new()).await.unwrap();
        assert_eq!(req.uri.path(), "/page");
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let hub = StreamHub::new();
        let mut sub = hub.requests_out();

        hub.close();

        assert!(sub.recv().await.is_none());
        assert_eq!(hub.consumer_count(HookStage::RequestOut), 0);

        let mut late = hub.requests_out();
        assert!(late.recv().await.is_none());
    }

    #[test]
    fn test_subscription_waits_for_messages() {
        let hub = StreamHub::new();
        let mut sub = hub.responses_in();

        let mut next = tokio_test::task::spawn(sub.recv());
        tokio_test::assert_pending!(next.poll());
        drop(next);

        hub.close();
        let mut next = tokio_test::task::spawn(sub.recv());
        tokio_test::assert_ready_eq!(next.poll(), None);
    }

    #[test]
    fn test_attach_registers_every_stage() {
        let hub = StreamHub::new();
        let hooks = hub.attach(&HookSet::new());

        for stage in HookStage::ALL {
            assert_eq!(hooks.count(stage), 1);
        }
    }
}
