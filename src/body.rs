//! Multi-reader, rewindable message body.
//!
//! A [`SharedBody`] wraps a body that can only be read once. The first access
//! that needs bytes drains the whole source into a buffer shared by every
//! clone; from then on each clone serves the same bytes from its own cursor.
//!
//! Ownership of the source is reference counted: closing or dropping one clone
//! never cuts off the others, the source is released when the last clone goes.

use bytes::Bytes;
use http_body::Body;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Source = UnsyncBoxBody<Bytes, BoxError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BodyError {
    #[error("Failed to read body: {0}")]
    Read(String),

    #[error("Body is closed")]
    Closed,
}

enum Buffering {
    Pending(Source),
    Buffered(Bytes),
    Failed(String),
    Released,
}

pub struct SharedBody {
    shared: Arc<Mutex<Buffering>>,
    cursor: usize,
    closed: bool,
}

impl SharedBody {
    /// Wrap a single-use body. Nothing is read until a clone needs bytes.
    pub fn new<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self::with_state(Buffering::Pending(body.map_err(Into::into).boxed_unsync()))
    }

    /// A body that is already fully buffered.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::with_state(Buffering::Buffered(bytes.into()))
    }

    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    fn with_state(state: Buffering) -> Self {
        Self {
            shared: Arc::new(Mutex::new(state)),
            cursor: 0,
            closed: false,
        }
    }

    async fn buffered(&self) -> Result<Bytes, BodyError> {
        if self.closed {
            return Err(BodyError::Closed);
        }

        let mut state = self.shared.lock().await;

        if matches!(*state, Buffering::Pending(_)) {
            // Marked failed while draining so a cancelled drain is not mistaken for an empty body
            let previous = std::mem::replace(
                &mut *state,
                Buffering::Failed("body drain was interrupted".to_string()),
            );
            if let Buffering::Pending(source) = previous {
                *state = match source.collect().await {
                    Ok(collected) => Buffering::Buffered(collected.to_bytes()),
                    Err(e) => {
                        tracing::debug!(error = %e, "Failed to drain body source");
                        Buffering::Failed(e.to_string())
                    }
                };
            }
        }

        match &*state {
            Buffering::Buffered(bytes) => Ok(bytes.clone()),
            Buffering::Failed(reason) => Err(BodyError::Read(reason.clone())),
            Buffering::Pending(_) | Buffering::Released => Err(BodyError::Closed),
        }
    }

    /// Whole body content. Preferred accessor for hooks.
    pub async fn bytes(&self) -> Result<Bytes, BodyError> {
        self.buffered().await
    }

    /// Copy the next bytes from this clone's cursor into `buf`.
    ///
    /// Returns `Ok(0)` at end of stream. A clone is meant to be read by one
    /// consumer at a time; hand other consumers their own clone.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, BodyError> {
        let bytes = self.buffered().await?;

        if self.cursor >= bytes.len() {
            return Ok(0);
        }

        let count = buf.len().min(bytes.len() - self.cursor);
        buf[..count].copy_from_slice(&bytes[self.cursor..self.cursor + count]);
        self.cursor += count;

        Ok(count)
    }

    /// Reset this clone's cursor to the start. Other clones are unaffected.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Swap this handle over to new content. Existing clones keep the old bytes.
    pub fn replace(&mut self, bytes: impl Into<Bytes>) {
        *self = Self::from_bytes(bytes);
    }

    /// Stop reading through this clone.
    ///
    /// The underlying source is released only when this is the last clone.
    pub fn close(&mut self) {
        self.closed = true;
        self.cursor = 0;

        if Arc::strong_count(&self.shared) == 1 {
            if let Ok(mut state) = self.shared.try_lock() {
                *state = Buffering::Released;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Cloning yields an independent reader positioned at the start of the body.
impl Clone for SharedBody {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            cursor: 0,
            closed: false,
        }
    }
}

impl Default for SharedBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for SharedBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBody")
            .field("cursor", &self.cursor)
            .field("closed", &self.closed)
            .finish()
    }
}

impl From<Bytes> for SharedBody {
    fn from(bytes: Bytes) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<&'static str> for SharedBody {
    fn from(text: &'static str) -> Self {
        Self::from_bytes(Bytes::from_static(text.as_bytes()))
    }
}
