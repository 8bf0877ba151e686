use std::sync::Arc;

use tower::Layer;

use super::controller::AdmissionController;
use super::service::AdmissionService;
use crate::ratelimit::ClientKeyResolver;

/// Applies admission control to requests.
#[derive(Clone)]
pub struct AdmissionLayer {
    controller: Arc<AdmissionController>,
    resolver: ClientKeyResolver,
}

impl AdmissionLayer {
    /// Create an AdmissionLayer
    pub fn new(controller: Arc<AdmissionController>, resolver: ClientKeyResolver) -> Self {
        Self {
            controller,
            resolver,
        }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService::new(service, self.controller.clone(), self.resolver.clone())
    }
}
