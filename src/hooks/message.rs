//! Messages handed to hooks.

use crate::body::SharedBody;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Correlates one intercepted request with its response across all six stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(Uuid);

impl ExchangeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ExchangeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Byte access shared by every message type the pipeline handles.
pub trait HttpMessage: Clone + Send + Sync + 'static {
    fn body(&self) -> &SharedBody;
    fn body_mut(&mut self) -> &mut SharedBody;
}

/// A request as seen by hooks. Cloning gives an independent body reader.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: SharedBody,
}

impl InterceptedRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: SharedBody::empty(),
        }
    }

    pub fn with_body(mut self, body: impl Into<SharedBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Value of the `Host` header, if present and valid UTF-8.
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(http::header::HOST)
            .and_then(|value| value.to_str().ok())
    }
}

impl HttpMessage for InterceptedRequest {
    fn body(&self) -> &SharedBody {
        &self.body
    }

    fn body_mut(&mut self) -> &mut SharedBody {
        &mut self.body
    }
}

/// A response as seen by hooks, with the method and URI of the request it answers.
#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: SharedBody,
    pub request_method: Method,
    pub request_uri: Uri,
}

impl InterceptedResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: SharedBody::empty(),
            request_method: Method::GET,
            request_uri: Uri::from_static("/"),
        }
    }

    pub fn with_body(mut self, body: impl Into<SharedBody>) -> Self {
        self.body = body.into();
        self
    }
}

impl HttpMessage for InterceptedResponse {
    fn body(&self) -> &SharedBody {
        &self.body
    }

    fn body_mut(&mut self) -> &mut SharedBody {
        &mut self.body
    }
}

// Textual HTTP-version token used in start and status lines.
pub fn format_http_version(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

pub fn parse_http_version(token: &str) -> Version {
    match token {
        "HTTP/0.9" => Version::HTTP_09,
        "HTTP/1.0" => Version::HTTP_10,
        "HTTP/2" | "HTTP/2.0" => Version::HTTP_2,
        "HTTP/3" | "HTTP/3.0" => Version::HTTP_3,
        _ => Version::HTTP_11,
    }
}
