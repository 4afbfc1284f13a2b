//! Decides which traffic gets intercepted.
//!
//! Domain decisions are made once per CONNECT, request decisions once per
//! request inside an intercepted tunnel. Both default to "intercept".

pub mod filters;

use crate::hooks::InterceptedRequest;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

pub use filters::{exclude_file_extensions, exclude_file_types};

/// Predicate over a single request. Every registered filter must accept for
/// the request to reach the hooks.
#[cfg_attr(test, mockall::automock)]
pub trait RequestFilter: Send + Sync {
    fn should_intercept(&self, request: &InterceptedRequest) -> bool;
}

impl<F> RequestFilter for F
where
    F: Fn(&InterceptedRequest) -> bool + Send + Sync,
{
    fn should_intercept(&self, request: &InterceptedRequest) -> bool {
        (self)(request)
    }
}

/// Immutable snapshot of the interception rules.
#[derive(Clone, Default)]
pub struct InterceptionCriteria {
    domain_pattern: Option<Regex>,
    request_filters: Vec<Arc<dyn RequestFilter>>,
}

impl InterceptionCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no domain pattern is set or the pattern matches `domain`.
    pub fn should_intercept_domain(&self, domain: &str) -> bool {
        match &self.domain_pattern {
            Some(pattern) => pattern.is_match(domain),
            None => true,
        }
    }

    /// True when every filter accepts. Stops at the first rejection.
    pub fn should_intercept_request(&self, request: &InterceptedRequest) -> bool {
        self.request_filters
            .iter()
            .all(|filter| filter.should_intercept(request))
    }

    pub fn with_domain_pattern(&self, pattern: Regex) -> Self {
        Self {
            domain_pattern: Some(pattern),
            request_filters: self.request_filters.clone(),
        }
    }

    pub fn without_domain_pattern(&self) -> Self {
        Self {
            domain_pattern: None,
            request_filters: self.request_filters.clone(),
        }
    }

    pub fn with_request_filter(&self, filter: Arc<dyn RequestFilter>) -> Self {
        let mut request_filters = self.request_filters.clone();
        request_filters.push(filter);

        Self {
            domain_pattern: self.domain_pattern.clone(),
            request_filters,
        }
    }

    pub fn domain_pattern(&self) -> Option<&Regex> {
        self.domain_pattern.as_ref()
    }

    pub fn request_filter_count(&self) -> usize {
        self.request_filters.len()
    }
}

impl fmt::Debug for InterceptionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptionCriteria")
            .field("domain_pattern", &self.domain_pattern.as_ref().map(Regex::as_str))
            .field("request_filters", &self.request_filters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Uri};

    fn request(uri: &'static str) -> InterceptedRequest {
        InterceptedRequest::new(Method::GET, Uri::from_static(uri))
    }

    #[test]
    fn test_default_intercepts_everything() {
        let criteria = InterceptionCriteria::default();

        assert!(criteria.should_intercept_domain("www.example.com"));
        assert!(criteria.should_intercept_domain(""));
        assert!(criteria.should_intercept_request(&request("https://www.example.com/")));
    }

    #[test]
    fn test_domain_pattern() {
        let criteria =
            InterceptionCriteria::new().with_domain_pattern(Regex::new(r"^intercept\.example\.com$").unwrap());

        assert!(criteria.should_intercept_domain("intercept.example.com"));
        assert!(!criteria.should_intercept_domain("other.example.com"));

        let cleared = criteria.without_domain_pattern();
        assert!(cleared.should_intercept_domain("other.example.com"));
        assert!(!criteria.should_intercept_domain("other.example.com"));
    }

    #[test]
    fn test_with_request_filter_does_not_alias() {
        let base = InterceptionCriteria::new();
        let first = base.with_request_filter(Arc::new(|_: &InterceptedRequest| true));
        let second = first.with_request_filter(Arc::new(|_: &InterceptedRequest| false));

        assert_eq!(base.request_filter_count(), 0);
        assert_eq!(first.request_filter_count(), 1);
        assert_eq!(second.request_filter_count(), 2);

        let req = request("https://example.com/");
        assert!(first.should_intercept_request(&req));
        assert!(!second.should_intercept_request(&req));
    }

    #[test]
    fn test_filters_short_circuit() {
        let mut rejecting = MockRequestFilter::new();
        rejecting.expect_should_intercept().times(1).return_const(false);

        let mut never_called = MockRequestFilter::new();
        never_called.expect_should_intercept().times(0);

        let criteria = InterceptionCriteria::new()
            .with_request_filter(Arc::new(rejecting))
            .with_request_filter(Arc::new(never_called));

        assert!(!criteria.should_intercept_request(&request("https://example.com/")));
    }

    #[test]
    fn test_all_filters_consulted_when_accepting() {
        let mut criteria = InterceptionCriteria::new();
        for _ in 0..3 {
            let mut filter = MockRequestFilter::new();
            filter.expect_should_intercept().times(1).return_const(true);
            criteria = criteria.with_request_filter(Arc::new(filter));
        }

        assert!(criteria.should_intercept_request(&request("https://example.com/")));
    }
}
