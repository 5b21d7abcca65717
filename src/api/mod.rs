pub mod metrics;
pub mod processes;
pub mod rules;

pub use metrics::get_metrics;
pub use processes::{clear_focus, get_alerts, get_process, get_status, list_processes, set_focus};
pub use rules::{
    add_defaults, add_disallowed, add_permanent, add_rule, list_defaults, list_disallowed,
    list_permanent, list_rules, remove_defaults, remove_disallowed, remove_permanent, remove_rule,
};

use actix_web::{web, HttpResponse, Responder};

use crate::error::CatalogError;

pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy"
    }))
}

/// 注册全部路由，main 和测试共用
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/rules", web::get().to(list_rules))
        .route("/api/rules", web::post().to(add_rule))
        .route("/api/rules", web::delete().to(remove_rule))
        .route("/api/disallowed", web::get().to(list_disallowed))
        .route("/api/disallowed", web::post().to(add_disallowed))
        .route("/api/disallowed/{name}", web::delete().to(remove_disallowed))
        .route("/api/permanent", web::get().to(list_permanent))
        .route("/api/permanent", web::post().to(add_permanent))
        .route("/api/permanent/{name}", web::delete().to(remove_permanent))
        .route("/api/defaults", web::get().to(list_defaults))
        .route("/api/defaults", web::post().to(add_defaults))
        .route("/api/defaults/{name}", web::delete().to(remove_defaults))
        .route("/api/processes", web::get().to(list_processes))
        .route("/api/processes/{pid}", web::get().to(get_process))
        .route("/api/focus/{pid}", web::put().to(set_focus))
        .route("/api/focus/{pid}", web::delete().to(clear_focus))
        .route("/api/alerts", web::get().to(get_alerts))
        .route("/api/status", web::get().to(get_status))
        .route("/metrics", web::get().to(get_metrics))
        .route("/health", web::get().to(health));
}

fn error_body(message: String) -> serde_json::Value {
    serde_json::json!({
        "status": "error",
        "message": message
    })
}

pub(crate) fn catalog_error(e: CatalogError) -> HttpResponse {
    let body = error_body(e.to_string());
    match e {
        CatalogError::Duplicate(_) => HttpResponse::Conflict().json(body),
        CatalogError::NotFound(_) => HttpResponse::NotFound().json(body),
        CatalogError::Invalid(_) => HttpResponse::BadRequest().json(body),
    }
}

pub(crate) fn not_found(message: String) -> HttpResponse {
    HttpResponse::NotFound().json(error_body(message))
}
