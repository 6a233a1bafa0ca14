// src/routes/metrics_route.rs

use std::sync::Arc;

use actix_web::dev::Server;
use actix_web::{web, App, HttpResponse, HttpServer};
use prometheus::TEXT_FORMAT;
use tracing::{error, info};

use crate::services::metrics_service::WorkerMetrics;

pub fn metrics_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("metrics")
            .route("/health", web::get().to(|| async {
                HttpResponse::Ok().body("healthy")
            }))
            .route("", web::get().to(render_metrics)),
    );
}

async fn render_metrics(metrics: web::Data<WorkerMetrics>) -> HttpResponse {
    match metrics.render() {
        Ok(body) => HttpResponse::Ok().content_type(TEXT_FORMAT).body(body),
        Err(err) => {
            error!(target: "metrics", error = %err, "failed to render metrics");
            HttpResponse::InternalServerError().finish()
        }
    }
}

/// Bind the exporter. The returned server must be polled (spawned) to serve.
///
/// Signal handling stays with the caller, which stops the server through its
/// handle after draining.
pub fn serve_metrics(addr: &str, metrics: Arc<WorkerMetrics>) -> std::io::Result<Server> {
    let data = web::Data::from(metrics);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .configure(metrics_routes)
    })
    .workers(1)
    .disable_signals()
    .bind(addr)?
    .run();

    info!(target: "metrics", %addr, "📈 metrics exporter listening");
    Ok(server)
}
