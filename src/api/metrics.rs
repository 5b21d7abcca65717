use actix_web::{web, HttpResponse, Responder};

use crate::metrics::METRICS;
use crate::state::WatchdogState;

pub async fn get_metrics(data: web::Data<WatchdogState>) -> impl Responder {
    // 评估循环之外也保证 gauge 是最新的
    METRICS.tracked_processes.set(data.store.len() as i64);

    match METRICS.render() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => {
            log::error!("Failed to render metrics: {}", e);
            HttpResponse::InternalServerError().body(format!("Error: {}", e))
        }
    }
}
