use std::sync::Arc;
use std::task::{Context, Poll};

use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use http::Request;
use tower::Service;
use tracing::debug;

use super::controller::AdmissionController;
use crate::ratelimit::{ClientKeyResolver, RequestOrigin};

/// Middleware that admits or rejects each request before the inner service
/// sees it, and holds the client's concurrency lease until the inner service
/// has produced a response.
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    controller: Arc<AdmissionController>,
    resolver: ClientKeyResolver,
}

impl<S> AdmissionService<S> {
    pub fn new(inner: S, controller: Arc<AdmissionController>, resolver: ClientKeyResolver) -> Self {
        Self {
            inner,
            controller,
            resolver,
        }
    }
}

impl<S, B> Service<Request<B>> for AdmissionService<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        // Keep the instance that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let controller = self.controller.clone();
        let client = self.resolver.resolve(&RequestOrigin::from_request(&request));

        Box::pin(async move {
            let admission = match controller.admit(&client).await {
                Ok(admission) => admission,
                Err(rejection) => {
                    debug!(client = %client, reason = %rejection, "Request rejected");
                    return Ok(rejection.into_response());
                }
            };

            // If this future is dropped or the handler panics, dropping
            // `admission` releases the lease in the background.
            let result = inner.call(request).await;
            admission.release().await;
            result
        })
    }
}
