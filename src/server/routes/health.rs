//! Health, metrics, and operator-facing instance-control routes.

use crate::server::routes::{error_response, ApiResponse};
use crate::server::state::AppState;
use actix_web::{get, post, web, HttpResponse, Responder};

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> impl Responder {
    let report = state.service.dispatcher().health().await;
    HttpResponse::Ok().json(ApiResponse::success(report))
}

#[get("/metrics")]
pub async fn metrics(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(state.metrics.render())
}

#[post("/instances/{id}/reset")]
pub async fn reset_instance(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let instance_id = path.into_inner();
    if state.service.dispatcher().reset_instance(&instance_id) {
        HttpResponse::Ok().json(ApiResponse::success(()))
    } else {
        error_response(&crate::utils::error::DispatchError::NotFound(format!(
            "no such instance: {instance_id}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_maps_not_found_to_404() {
        let err = crate::utils::error::DispatchError::NotFound("x".into());
        let response = error_response(&err);
        assert_eq!(response.status(), actix_web::http::StatusCode::NOT_FOUND);
    }
}
