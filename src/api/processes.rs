use actix_web::{web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};

use crate::api::not_found;
use crate::models::{normalize_name, ProcessIdentity, ProcessSnapshot};
use crate::state::WatchdogState;

const DEFAULT_ALERT_LIMIT: usize = 100;

#[derive(Deserialize)]
pub struct ProcessQuery {
    /// 名称子串，忽略大小写
    pub name: Option<String>,
}

#[derive(Deserialize)]
pub struct AlertQuery {
    pub limit: Option<usize>,
}

/// 列表里的单行摘要，完整快照走 `/api/processes/{pid}`
#[derive(Debug, Serialize)]
pub struct ProcessSummary {
    pub identity: ProcessIdentity,
    pub name: String,
    pub image_path: String,
    pub threads: usize,
    pub modules: usize,
    pub handles: usize,
    pub committed_bytes: u64,
    pub last_updated: u64,
}

impl From<&ProcessSnapshot> for ProcessSummary {
    fn from(snapshot: &ProcessSnapshot) -> Self {
        Self {
            identity: snapshot.identity,
            name: snapshot.metadata.name.clone(),
            image_path: snapshot.metadata.image_path.clone(),
            threads: snapshot.thread_count(),
            modules: snapshot.modules.len(),
            handles: snapshot.handles.len(),
            committed_bytes: snapshot.committed_bytes(),
            last_updated: snapshot.last_updated,
        }
    }
}

pub async fn list_processes(
    data: web::Data<WatchdogState>,
    query: web::Query<ProcessQuery>,
) -> impl Responder {
    let filter = query.name.as_deref().map(normalize_name);
    let mut processes: Vec<ProcessSummary> = data
        .store
        .identities()
        .iter()
        .filter_map(|identity| data.store.snapshot(identity))
        .filter(|snapshot| match &filter {
            Some(f) => snapshot.metadata.match_key().contains(f.as_str()),
            None => true,
        })
        .map(|snapshot| ProcessSummary::from(&snapshot))
        .collect();
    processes.sort_by_key(|p| p.identity);

    HttpResponse::Ok().json(serde_json::json!({
        "total": processes.len(),
        "processes": processes
    }))
}

pub async fn get_process(data: web::Data<WatchdogState>, path: web::Path<u32>) -> impl Responder {
    let pid = path.into_inner();
    match data
        .store
        .identity_for_pid(pid)
        .and_then(|identity| data.store.snapshot(&identity))
    {
        Some(snapshot) => HttpResponse::Ok().json(snapshot),
        None => not_found(format!("Process {} is not tracked", pid)),
    }
}

pub async fn set_focus(data: web::Data<WatchdogState>, path: web::Path<u32>) -> impl Responder {
    let pid = path.into_inner();
    let Some(identity) = data.store.identity_for_pid(pid) else {
        return not_found(format!("Process {} is not tracked", pid));
    };

    data.set_focus(identity);
    log::info!("Focus set to {}", identity);
    HttpResponse::Ok().json(serde_json::json!({
        "status": "success",
        "focus": identity
    }))
}

pub async fn clear_focus(data: web::Data<WatchdogState>, path: web::Path<u32>) -> impl Responder {
    let pid = path.into_inner();
    if data.ingestor.focus().map(|f| f.pid) != Some(pid) {
        return not_found(format!("Process {} is not the focus target", pid));
    }

    let cleared = data.clear_focus();
    log::info!("Focus cleared");
    HttpResponse::Ok().json(serde_json::json!({
        "status": "success",
        "cleared": cleared
    }))
}

pub async fn get_alerts(
    data: web::Data<WatchdogState>,
    query: web::Query<AlertQuery>,
) -> impl Responder {
    let alerts = data.alerts.recent(query.limit.unwrap_or(DEFAULT_ALERT_LIMIT));
    HttpResponse::Ok().json(serde_json::json!({
        "total": alerts.len(),
        "alerts": alerts
    }))
}

pub async fn get_status(data: web::Data<WatchdogState>) -> impl Responder {
    HttpResponse::Ok().json(data.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::configure;
    use crate::models::{DisallowedProcess, ProcessMetadata};
    use crate::testing::Harness;
    use actix_web::{http::StatusCode, test, App};

    #[actix_rt::test]
    async fn test_process_read_surface() {
        let dir = tempfile::tempdir().unwrap();
        let h = Harness::new(dir.path());
        h.state
            .ingestor
            .start_process(ProcessIdentity::new(42, 420), ProcessMetadata::new("nginx"));
        h.state
            .ingestor
            .start_process(ProcessIdentity::new(43, 430), ProcessMetadata::new("redis"));

        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(h.state.clone()))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/processes?name=NGI").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["processes"][0]["identity"]["pid"], 42);

        let req = test::TestRequest::get().uri("/api/processes/43").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["metadata"]["name"], "redis");

        let req = test::TestRequest::get().uri("/api/processes/99").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_rt::test]
    async fn test_focus_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let h = Harness::new(dir.path());
        let identity = ProcessIdentity::new(7, 70);
        h.state
            .ingestor
            .start_process(identity, ProcessMetadata::new("svc"));

        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(h.state.clone()))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::put().uri("/api/focus/7").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
        assert_eq!(h.state.ingestor.focus(), Some(identity));

        let req = test::TestRequest::delete().uri("/api/focus/8").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::delete().uri("/api/focus/7").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
        assert_eq!(h.state.ingestor.focus(), None);

        let req = test::TestRequest::put().uri("/api/focus/8").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_rt::test]
    async fn test_alerts_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let h = Harness::new(dir.path());
        h.inspector.spawn(5, 50, "miner", vec![5]);
        h.state.reconciler.reconcile();
        h.state
            .catalog
            .add_disallowed(DisallowedProcess {
                name: "miner".into(),
                notify: true,
            })
            .unwrap();
        h.state.evaluator.run_pass();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(h.state.clone()))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/alerts?limit=10").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["alerts"][0]["process_name"], "miner");

        let req = test::TestRequest::get().uri("/api/status").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["tracked_processes"], 1);
        assert_eq!(body["last_pass"]["evaluated"], 1);
    }
}
