//! Stock request filters.

use super::RequestFilter;
use crate::hooks::InterceptedRequest;
use regex::Regex;
use std::sync::Arc;

/// Skip requests whose path ends in an extension fully matching `pattern`
/// (case-insensitive). Paths without an extension are always accepted.
pub fn exclude_file_extensions(pattern: &str) -> Result<Arc<dyn RequestFilter>, regex::Error> {
    let extension_re = Regex::new(&format!("(?i)^(?:{pattern})$"))?;

    Ok(Arc::new(move |request: &InterceptedRequest| {
        match request.uri.path().rsplit_once('.') {
            Some((_, extension)) => !extension_re.is_match(extension),
            None => true,
        }
    }))
}

/// Filter on the `Accept` header: keep the request when the header matches
/// `include`, or when it does not match `exclude`. Both are case-insensitive.
pub fn exclude_file_types(include: &str, exclude: &str) -> Result<Arc<dyn RequestFilter>, regex::Error> {
    let include_re = Regex::new(&format!("(?i){include}"))?;
    let exclude_re = Regex::new(&format!("(?i){exclude}"))?;

    Ok(Arc::new(move |request: &InterceptedRequest| {
        let accept = request
            .headers
            .get(http::header::ACCEPT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");

        include_re.is_match(accept) || !exclude_re.is_match(accept)
    }))
}
