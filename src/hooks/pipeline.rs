//! Stage execution for request and response hooks.

use super::{ExchangeId, HookError, HookSet, HookStage, HttpMessage, Observer, StageHooks};
use super::{InterceptedRequest, InterceptedResponse};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, error};

/// Run request_in, request_mod and request_out against `request`.
///
/// Returns once the modifiers are done. Observers keep running in the background.
pub async fn run_request_hooks(
    hooks: &HookSet,
    request: &mut InterceptedRequest,
    id: ExchangeId,
) -> Result<(), HookError> {
    run_hooks(
        &hooks.request,
        request,
        id,
        [HookStage::RequestIn, HookStage::RequestMod, HookStage::RequestOut],
    )
    .await
}

/// Run response_in, response_mod and response_out against `response`.
pub async fn run_response_hooks(
    hooks: &HookSet,
    response: &mut InterceptedResponse,
    id: ExchangeId,
) -> Result<(), HookError> {
    run_hooks(
        &hooks.response,
        response,
        id,
        [HookStage::ResponseIn, HookStage::ResponseMod, HookStage::ResponseOut],
    )
    .await
}

async fn run_hooks<M: HttpMessage>(
    hooks: &StageHooks<M>,
    message: &mut M,
    id: ExchangeId,
    [in_stage, mod_stage, out_stage]: [HookStage; 3],
) -> Result<(), HookError> {
    spawn_observers(&hooks.inbound, message, id, in_stage);

    for (index, modifier) in hooks.modifiers.iter().enumerate() {
        if let Err(e) = modifier.modify(message, id).await {
            debug!(
                exchange_id = %id,
                stage = %mod_stage,
                index,
                error = %e,
                "Modifier failed, aborting exchange"
            );
            return Err(e);
        }
        message.body_mut().rewind();
    }

    spawn_observers(&hooks.outbound, message, id, out_stage);

    Ok(())
}

/// Hand each observer its own copy of `message` on a detached task.
fn spawn_observers<M: HttpMessage>(
    observers: &[Arc<dyn Observer<M>>],
    message: &M,
    id: ExchangeId,
    stage: HookStage,
) {
    if observers.is_empty() {
        return;
    }

    let snapshot = message.clone();
    let observers = observers.to_vec();

    tokio::spawn(async move {
        let tasks = observers.into_iter().map(|observer| {
            let message = snapshot.clone();
            tokio::spawn(async move { observer.observe(message, id).await })
        });

        for (index, result) in join_all(tasks).await.into_iter().enumerate() {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(exchange_id = %id, stage = %stage, index, error = %e, "Observer failed");
                }
                Err(e) => {
                    error!(exchange_id = %id, stage = %stage, index, error = %e, "Observer task panicked");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Modifier;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderValue, Method, Uri};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct SetHeader(&'static str, &'static str);

    #[async_trait]
    impl Modifier<InterceptedRequest> for SetHeader {
        async fn modify(
            &self,
            request: &mut InterceptedRequest,
            _id: ExchangeId,
        ) -> Result<(), HookError> {
            request
                .headers
                .insert(self.0, HeaderValue::from_static(self.1));
            Ok(())
        }
    }

    struct AppendBody(&'static str);

    #[async_trait]
    impl Modifier<InterceptedRequest> for AppendBody {
        async fn modify(
            &self,
            request: &mut InterceptedRequest,
            _id: ExchangeId,
        ) -> Result<(), HookError> {
            // read through the cursor to make sure the pipeline rewinds it
            let mut buf = vec![0u8; 64];
            let n = request.body.read(&mut buf).await?;
            let mut content = buf[..n].to_vec();
            content.extend_from_slice(self.0.as_bytes());
            request.body.replace(content);
            Ok(())
        }
    }

    struct Fail;

    #[async_trait]
    impl Modifier<InterceptedRequest> for Fail {
        async fn modify(
            &self,
            _request: &mut InterceptedRequest,
            _id: ExchangeId,
        ) -> Result<(), HookError> {
            Err(HookError::msg("rejected"))
        }
    }

    fn request() -> InterceptedRequest {
        let mut request = InterceptedRequest::new(Method::GET, Uri::from_static("https://example.com/"));
        request
            .headers
            .insert("x-original", HeaderValue::from_static("yes"));
        request.with_body("body")
    }

    fn recording_observer(
        tx: mpsc::UnboundedSender<(Option<String>, Bytes)>,
    ) -> Arc<dyn Observer<InterceptedRequest>> {
        Arc::new(move |request: InterceptedRequest, _id: ExchangeId| {
            let tx = tx.clone();
            async move {
                let marker = request
                    .headers
                    .get("x-modified")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = request.body.bytes().await?;
                let _ = tx.send((marker, body));
                Ok::<(), HookError>(())
            }
        })
    }

    #[tokio::test]
    async fn test_in_sees_original_and_out_sees_modified() {
        let (in_tx, mut in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        let hooks = HookSet::new()
            .with_request_in(recording_observer(in_tx))
            .with_request_mod(Arc::new(SetHeader("x-modified", "1")))
            .with_request_mod(Arc::new(AppendBody("-more")))
            .with_request_out(recording_observer(out_tx));

        let mut request = request();
        run_request_hooks(&hooks, &mut request, ExchangeId::new())
            .await
            .unwrap();

        let (in_marker, in_body) = in_rx.recv().await.unwrap();
        assert_eq!(in_marker, None);
        assert_eq!(in_body, Bytes::from("body"));

        let (out_marker, out_body) = out_rx.recv().await.unwrap();
        assert_eq!(out_marker.as_deref(), Some("1"));
        assert_eq!(out_body, Bytes::from("body-more"));

        assert_eq!(request.body.bytes().await.unwrap(), Bytes::from("body-more"));
        assert_eq!(request.body.position(), 0);
    }

    #[tokio::test]
    async fn test_modifiers_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Record(usize, Arc<Mutex<Vec<usize>>>);

        #[async_trait]
        impl Modifier<InterceptedRequest> for Record {
            async fn modify(
                &self,
                _request: &mut InterceptedRequest,
                _id: ExchangeId,
            ) -> Result<(), HookError> {
                self.1.lock().unwrap().push(self.0);
                Ok(())
            }
        }

        let mut hooks = HookSet::new();
        for i in 0..5 {
            hooks = hooks.with_request_mod(Arc::new(Record(i, order.clone())));
        }

        let mut request = request();
        run_request_hooks(&hooks, &mut request, ExchangeId::new())
            .await
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_modifier_error_aborts_remaining_stages() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        let hooks = HookSet::new()
            .with_request_mod(Arc::new(Fail))
            .with_request_mod(Arc::new(SetHeader("x-modified", "1")))
            .with_request_out(recording_observer(out_tx));

        let mut request = request();
        let result = run_request_hooks(&hooks, &mut request, ExchangeId::new()).await;

        assert!(matches!(result, Err(HookError::Failed(ref m)) if m == "rejected"));
        assert!(request.headers.get("x-modified").is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_observer_error_is_not_propagated() {
        let hooks = HookSet::new().with_request_in(Arc::new(
            |_request: InterceptedRequest, _id: ExchangeId| async {
                Err(HookError::msg("observer broke"))
            },
        ));

        let mut request = request();
        let result = run_request_hooks(&hooks, &mut request, ExchangeId::new()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_pending_observer_does_not_block() {
        let hooks = HookSet::new()
            .with_request_in(Arc::new(
                |_request: InterceptedRequest, _id: ExchangeId| async {
                    futures::future::pending::<()>().await;
                    Ok::<(), HookError>(())
                },
            ))
            .with_request_out(Arc::new(
                |_request: InterceptedRequest, _id: ExchangeId| async {
                    futures::future::pending::<()>().await;
                    Ok::<(), HookError>(())
                },
            ));

        let mut request = request();
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            run_request_hooks(&hooks, &mut request, ExchangeId::new()),
        )
        .await;

        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_exchange_id_reaches_response_hooks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hooks = HookSet::new().with_response_in(Arc::new(
            move |_response: InterceptedResponse, id: ExchangeId| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(id);
                    Ok::<(), HookError>(())
                }
            },
        ));

        let id = ExchangeId::new();
        let mut response = InterceptedResponse::new(http::StatusCode::OK);
        run_response_hooks(&hooks, &mut response, id).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), id);
    }
}
