use crate::body::BodyError;
use crate::hooks::message::{format_http_version, parse_http_version};
use crate::hooks::{ExchangeId, HookError, InterceptedRequest, InterceptedResponse};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireHeader {
    pub name: String,
    pub value: String,
}

/// Serializable copy of a request or response handed to stream consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: String,
    pub proto: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default)]
    pub headers: Vec<WireHeader>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl WireMessage {
    pub async fn from_request(request: &InterceptedRequest, id: ExchangeId) -> Result<Self, BodyError> {
        Ok(Self {
            id: id.to_string(),
            proto: format_http_version(request.version).to_string(),
            url: request.uri.to_string(),
            method: Some(request.method.to_string()),
            status: None,
            status_text: None,
            headers: wire_headers(&request.headers),
            body: request.body.bytes().await?.to_vec(),
        })
    }

    pub async fn from_response(response: &InterceptedResponse, id: ExchangeId) -> Result<Self, BodyError> {
        Ok(Self {
            id: id.to_string(),
            proto: format_http_version(response.version).to_string(),
            url: response.request_uri.to_string(),
            method: None,
            status: Some(response.status.as_u16()),
            status_text: response.status.canonical_reason().map(str::to_string),
            headers: wire_headers(&response.headers),
            body: response.body.bytes().await?.to_vec(),
        })
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Overwrite `request` with this message: version, method, URL, headers and body.
    pub fn apply_to_request(self, request: &mut InterceptedRequest) -> Result<(), HookError> {
        if let Some(method) = &self.method {
            request.method = Method::from_bytes(method.as_bytes())
                .map_err(|e| HookError::msg(format!("invalid method {method:?}: {e}")))?;
        }
        request.uri = self
            .url
            .parse::<Uri>()
            .map_err(|e| HookError::msg(format!("invalid url {:?}: {e}", self.url)))?;
        request.version = parse_http_version(&self.proto);
        request.headers = header_map(&self.headers)?;
        request.body.replace(self.body);
        Ok(())
    }

    /// Overwrite `response` with this message: version, status, headers and body.
    pub fn apply_to_response(self, response: &mut InterceptedResponse) -> Result<(), HookError> {
        if let Some(status) = self.status {
            response.status = StatusCode::from_u16(status)
                .map_err(|e| HookError::msg(format!("invalid status {status}: {e}")))?;
        }
        response.version = parse_http_version(&self.proto);
        response.headers = header_map(&self.headers)?;
        response.body.replace(self.body);
        Ok(())
    }
}

fn wire_headers(headers: &HeaderMap) -> Vec<WireHeader> {
    headers
        .iter()
        .map(|(name, value)| WireHeader {
            name: name.to_string(),
            value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
        })
        .collect()
}

fn header_map(headers: &[WireHeader]) -> Result<HeaderMap, HookError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for header in headers {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| HookError::msg(format!("invalid header name {:?}: {e}", header.name)))?;
        let value = HeaderValue::from_str(&header.value)
            .map_err(|e| HookError::msg(format!("invalid header value for {name}: {e}")))?;
        map.append(name, value);
    }
    Ok(map)
}
