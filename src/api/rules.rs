use actix_web::{web, HttpResponse, Responder};
use serde::Deserialize;

use crate::api::catalog_error;
use crate::error::CatalogError;
use crate::models::{
    DisallowedProcess, PermanentProcess, ProcessDefaultCpuSettings, RuleKind, WatchdogRule,
};
use crate::state::WatchdogState;

#[derive(Deserialize)]
pub struct RuleQuery {
    pub kind: Option<RuleKind>,
}

/// 目录变更成功后写盘；写盘失败时内存中的变更仍然生效
fn persisted(state: &WatchdogState, result: Result<(), CatalogError>, message: String) -> HttpResponse {
    if let Err(e) = result {
        log::warn!("Rule change rejected: {}", e);
        return catalog_error(e);
    }

    if let Err(e) = state.persist() {
        log::error!("Failed to persist rules to {:?}: {}", state.config.rules_file, e);
        return HttpResponse::InternalServerError().json(serde_json::json!({
            "status": "error",
            "message": format!("{} but saving failed: {}", message, e)
        }));
    }

    log::info!("{}", message);
    HttpResponse::Ok().json(serde_json::json!({
        "status": "success",
        "message": message
    }))
}

pub async fn list_rules(
    data: web::Data<WatchdogState>,
    query: web::Query<RuleQuery>,
) -> impl Responder {
    let rules = data.catalog.list_rules(query.kind);
    HttpResponse::Ok().json(serde_json::json!({
        "total": rules.len(),
        "rules": rules
    }))
}

pub async fn add_rule(
    data: web::Data<WatchdogState>,
    req: web::Json<WatchdogRule>,
) -> impl Responder {
    let rule = req.into_inner();
    let message = format!(
        "Rule added: {:?} '{}' {} -> {}",
        rule.kind(),
        rule.target(),
        rule.describe_threshold(),
        rule.action()
    );
    persisted(&data, data.catalog.add_rule(rule), message)
}

pub async fn remove_rule(
    data: web::Data<WatchdogState>,
    req: web::Json<WatchdogRule>,
) -> impl Responder {
    let rule = req.into_inner();
    let message = format!("Rule removed: {:?} '{}'", rule.kind(), rule.target());
    persisted(&data, data.catalog.remove_rule(&rule), message)
}

pub async fn list_disallowed(data: web::Data<WatchdogState>) -> impl Responder {
    HttpResponse::Ok().json(data.catalog.list_disallowed())
}

pub async fn add_disallowed(
    data: web::Data<WatchdogState>,
    req: web::Json<DisallowedProcess>,
) -> impl Responder {
    let entry = req.into_inner();
    let message = format!("Disallowed process added: '{}'", entry.name);
    persisted(&data, data.catalog.add_disallowed(entry), message)
}

pub async fn remove_disallowed(
    data: web::Data<WatchdogState>,
    path: web::Path<String>,
) -> impl Responder {
    let name = path.into_inner();
    let message = format!("Disallowed process removed: '{}'", name);
    persisted(&data, data.catalog.remove_disallowed(&name), message)
}

pub async fn list_permanent(data: web::Data<WatchdogState>) -> impl Responder {
    HttpResponse::Ok().json(data.catalog.list_permanent())
}

pub async fn add_permanent(
    data: web::Data<WatchdogState>,
    req: web::Json<PermanentProcess>,
) -> impl Responder {
    let entry = req.into_inner();
    let message = format!("Permanent process added: '{}'", entry.name);
    persisted(&data, data.catalog.add_permanent(entry), message)
}

pub async fn remove_permanent(
    data: web::Data<WatchdogState>,
    path: web::Path<String>,
) -> impl Responder {
    let name = path.into_inner();
    let message = format!("Permanent process removed: '{}'", name);
    persisted(&data, data.catalog.remove_permanent(&name), message)
}

pub async fn list_defaults(data: web::Data<WatchdogState>) -> impl Responder {
    HttpResponse::Ok().json(data.catalog.list_defaults())
}

pub async fn add_defaults(
    data: web::Data<WatchdogState>,
    req: web::Json<ProcessDefaultCpuSettings>,
) -> impl Responder {
    let settings = req.into_inner();
    let message = format!("Default CPU settings added: '{}'", settings.name);
    persisted(&data, data.catalog.add_defaults(settings), message)
}

pub async fn remove_defaults(
    data: web::Data<WatchdogState>,
    path: web::Path<String>,
) -> impl Responder {
    let name = path.into_inner();
    let message = format!("Default CPU settings removed: '{}'", name);
    persisted(&data, data.catalog.remove_defaults(&name), message)
}
