//! Hook registration surface and pipeline.
//!
//! Six fixed stages wrap every intercepted exchange:
//!
//! - `request_in` / `response_in`: observers, run detached on the message as it
//!   arrived, before any modification.
//! - `request_mod` / `response_mod`: modifiers, run one at a time in
//!   registration order; the exchange waits for them and a failure aborts it.
//! - `request_out` / `response_out`: observers, run detached on the message as
//!   it will be forwarded.
//!
//! Observer failures are only ever reported through `tracing`; callers cannot
//! see or react to them.

pub mod message;
pub mod pipeline;

use crate::body::BodyError;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

pub use message::{ExchangeId, HttpMessage, InterceptedRequest, InterceptedResponse};
pub use pipeline::{run_request_hooks, run_response_hooks};

#[derive(Debug, Error)]
pub enum HookError {
    #[error("{0}")]
    Failed(String),

    #[error("Body unavailable: {0}")]
    Body(#[from] BodyError),
}

impl HookError {
    pub fn msg(message: impl fmt::Display) -> Self {
        HookError::Failed(message.to_string())
    }
}

/// Read-only hook. Receives its own copy of the message.
#[async_trait]
pub trait Observer<M: Send + 'static>: Send + Sync {
    async fn observe(&self, message: M, id: ExchangeId) -> Result<(), HookError>;
}

/// Mutating hook. Changes made to the message are what gets forwarded.
#[async_trait]
pub trait Modifier<M: Send + 'static>: Send + Sync {
    async fn modify(&self, message: &mut M, id: ExchangeId) -> Result<(), HookError>;
}

#[async_trait]
impl<M, F, Fut> Observer<M> for F
where
    M: Send + 'static,
    F: Fn(M, ExchangeId) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HookError>> + Send,
{
    async fn observe(&self, message: M, id: ExchangeId) -> Result<(), HookError> {
        (self)(message, id).await
    }
}

pub type RequestObserver = Arc<dyn Observer<InterceptedRequest>>;
pub type RequestModifier = Arc<dyn Modifier<InterceptedRequest>>;
pub type ResponseObserver = Arc<dyn Observer<InterceptedResponse>>;
pub type ResponseModifier = Arc<dyn Modifier<InterceptedResponse>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    RequestIn,
    RequestMod,
    RequestOut,
    ResponseIn,
    ResponseMod,
    ResponseOut,
}

impl HookStage {
    pub const ALL: [HookStage; 6] = [
        HookStage::RequestIn,
        HookStage::RequestMod,
        HookStage::RequestOut,
        HookStage::ResponseIn,
        HookStage::ResponseMod,
        HookStage::ResponseOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookStage::RequestIn => "request_in",
            HookStage::RequestMod => "request_mod",
            HookStage::RequestOut => "request_out",
            HookStage::ResponseIn => "response_in",
            HookStage::ResponseMod => "response_mod",
            HookStage::ResponseOut => "response_out",
        }
    }
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observers and modifiers for one direction of the exchange.
pub struct StageHooks<M: Send + 'static> {
    pub inbound: Vec<Arc<dyn Observer<M>>>,
    pub modifiers: Vec<Arc<dyn Modifier<M>>>,
    pub outbound: Vec<Arc<dyn Observer<M>>>,
}

impl<M: Send + 'static> StageHooks<M> {
    pub fn is_empty(&self) -> bool {
        self.inbound.is_empty() && self.modifiers.is_empty() && self.outbound.is_empty()
    }
}

impl<M: Send + 'static> Default for StageHooks<M> {
    fn default() -> Self {
        Self {
            inbound: Vec::new(),
            modifiers: Vec::new(),
            outbound: Vec::new(),
        }
    }
}

impl<M: Send + 'static> Clone for StageHooks<M> {
    fn clone(&self) -> Self {
        Self {
            inbound: self.inbound.clone(),
            modifiers: self.modifiers.clone(),
            outbound: self.outbound.clone(),
        }
    }
}

/// Immutable set of registered hooks. Every `with_*` call returns a new set.
#[derive(Clone, Default)]
pub struct HookSet {
    pub request: StageHooks<InterceptedRequest>,
    pub response: StageHooks<InterceptedResponse>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_in(&self, hook: RequestObserver) -> Self {
        let mut hooks = self.clone();
        hooks.request.inbound.push(hook);
        hooks
    }

    pub fn with_request_mod(&self, hook: RequestModifier) -> Self {
        let mut hooks = self.clone();
        hooks.request.modifiers.push(hook);
        hooks
    }

    pub fn with_request_out(&self, hook: RequestObserver) -> Self {
        let mut hooks = self.clone();
        hooks.request.outbound.push(hook);
        hooks
    }

    pub fn with_response_in(&self, hook: ResponseObserver) -> Self {
        let mut hooks = self.clone();
        hooks.response.inbound.push(hook);
        hooks
    }

    pub fn with_response_mod(&self, hook: ResponseModifier) -> Self {
        let mut hooks = self.clone();
        hooks.response.modifiers.push(hook);
        hooks
    }

    pub fn with_response_out(&self, hook: ResponseObserver) -> Self {
        let mut hooks = self.clone();
        hooks.response.outbound.push(hook);
        hooks
    }

    /// Number of hooks registered at a stage.
    pub fn count(&self, stage: HookStage) -> usize {
        match stage {
            HookStage::RequestIn => self.request.inbound.len(),
            HookStage::RequestMod => self.request.modifiers.len(),
            HookStage::RequestOut => self.request.outbound.len(),
            HookStage::ResponseIn => self.response.inbound.len(),
            HookStage::ResponseMod => self.response.modifiers.len(),
            HookStage::ResponseOut => self.response.outbound.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.request.is_empty() && self.response.is_empty()
    }
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("HookSet");
        for stage in HookStage::ALL {
            debug.field(stage.as_str(), &self.count(stage));
        }
        debug.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Modifier<InterceptedRequest> for Noop {
        async fn modify(
            &self,
            _message: &mut InterceptedRequest,
            _id: ExchangeId,
        ) -> Result<(), HookError> {
            Ok(())
        }
    }

    fn observer() -> RequestObserver {
        Arc::new(|_req: InterceptedRequest, _id: ExchangeId| async {
            Ok::<(), HookError>(())
        })
    }

    #[test]
    fn test_with_returns_new_set() {
        let empty = HookSet::new();
        let one = empty.with_request_in(observer());
        let two = one.with_request_mod(Arc::new(Noop));

        assert!(empty.is_empty());
        assert_eq!(one.count(HookStage::RequestIn), 1);
        assert_eq!(one.count(HookStage::RequestMod), 0);
        assert_eq!(two.count(HookStage::RequestIn), 1);
        assert_eq!(two.count(HookStage::RequestMod), 1);
    }

    #[test]
    fn test_stage_names() {
        let names: Vec<_> = HookStage::ALL.iter().map(|s| s.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "request_in",
                "request_mod",
                "request_out",
                "response_in",
                "response_mod",
                "response_out"
            ]
        );
    }
}
