//! Seams to the transport layer and the error-reporting collaborator.

use std::future::Future;

use async_trait::async_trait;
use tracing::error;

use crate::{ListResponse, RefError, RefResult, ReferenceQuery};

/// Fetch function for one resource type.
///
/// Implementations must honour the id filter in `query` and return zero or
/// more matching entities. "Not found" is expressed by omission, never by an
/// error. Timeouts are the implementation's responsibility.
#[async_trait]
pub trait ReferenceFetcher: Send + Sync {
    async fn fetch(&self, query: &ReferenceQuery) -> RefResult<ListResponse>;
}

/// Adapts an async closure into a [`ReferenceFetcher`].
///
/// ```ignore
/// let fetcher = FnFetcher::new(|query: ReferenceQuery| async move {
///     api.project_list(query).await
/// });
/// ```
pub struct FnFetcher<F> {
    f: F,
}

impl<F> FnFetcher<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> ReferenceFetcher for FnFetcher<F>
where
    F: Fn(ReferenceQuery) -> Fut + Send + Sync,
    Fut: Future<Output = RefResult<ListResponse>> + Send,
{
    async fn fetch(&self, query: &ReferenceQuery) -> RefResult<ListResponse> {
        (self.f)(query.clone()).await
    }
}

/// Receives fetch failures that were recovered at the repository boundary.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, resource_key: &str, error: &RefError);
}

/// Reports errors through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, resource_key: &str, err: &RefError) {
        error!(resource_key = resource_key, error = %err, "Reference fetch failed");
    }
}
