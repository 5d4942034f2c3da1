//! Metrics middleware for request monitoring

use crate::server::state::AppState;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::web;
use futures_util::future::{ready, Ready};
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;
use tracing::info;

/// Metrics middleware for Actix-web
pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = actix_web::Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

/// Service implementation for metrics middleware
pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = actix_web::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let method = req.method().to_string();
        let path = req.path().to_string();
        let app_state = req.app_data::<web::Data<AppState>>().cloned();

        if let Some(state) = &app_state {
            state.metrics.active_requests.inc();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let res = fut.await?;

            let response_time = start_time.elapsed();
            let status_code = res.status().as_u16();

            if let Some(state) = &app_state {
                state.metrics.active_requests.dec();
            }

            info!(
                "{} {} -> {} in {:?}",
                method, path, status_code, response_time
            );

            Ok(res)
        })
    }
}
