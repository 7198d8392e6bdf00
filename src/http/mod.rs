//! HTTP surface (§6): webhook ingress, scheduler control/introspection, and
//! the one-shot `/execute` endpoint. Everything here is a thin translation
//! layer over [`crate::webhook::WebhookIngress`], [`crate::scheduler::Scheduler`]
//! and [`crate::poller::Poller`] — no business logic lives in handlers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::scheduler::CadenceBucket;
use crate::webhook::IngressOutcome;
use crate::AppContext;

pub async fn start_server(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], ctx.config.port).into();
    let router = build_router(ctx);

    info!(%addr, "HTTP surface listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/webhooks/{service}", post(webhook_ingress))
        .route("/scheduler/run", post(scheduler_run))
        .route("/scheduler/polling", post(scheduler_polling))
        .route("/scheduler/scheduled-runs", post(scheduler_scheduled_runs))
        .route("/scheduler/trigger", post(scheduler_trigger))
        .route("/execute", post(execute_automation))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

// ─── Webhook ingress (§4.4) ────────────────────────────────────────────────

async fn webhook_ingress(
    State(ctx): State<Arc<AppContext>>,
    Path(service): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    raw_body: axum::body::Bytes,
) -> Response {
    let query_pairs: Vec<(String, String)> = query.into_iter().collect();
    let lowercased_headers: HashMap<String, String> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_ascii_lowercase(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();

    let outcome = ctx
        .ingress
        .handle(&service, &query_pairs, &lowercased_headers, &raw_body)
        .await;

    match outcome {
        IngressOutcome::Handshake { status, body } => {
            let code = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            (code, [(axum::http::header::CONTENT_TYPE, "text/plain")], body).into_response()
        }
        IngressOutcome::Unauthorized => {
            (StatusCode::UNAUTHORIZED, Json(json!({"error": "signature verification failed"})))
                .into_response()
        }
        IngressOutcome::BadRequest(msg) => {
            (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response()
        }
        IngressOutcome::TenantUnresolved => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "connect the service"})),
        )
            .into_response(),
        IngressOutcome::Accepted { enqueued, duplicates } => (
            StatusCode::OK,
            Json(json!({
                "enqueued": enqueued,
                "duplicates": duplicates,
                "filtered": enqueued == 0 && duplicates == 0,
            })),
        )
            .into_response(),
    }
}

// ─── Scheduler control surface (§6) ────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SchedulerRunBody {
    interval: String,
}

async fn scheduler_run(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<SchedulerRunBody>,
) -> Response {
    let Some(bucket) = CadenceBucket::parse(&body.interval) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("unknown interval: {}", body.interval)})),
        )
            .into_response();
    };
    match ctx.scheduler.run_bucket(bucket).await {
        Ok(dispatched) => Json(json!({"dispatched": dispatched})).into_response(),
        Err(e) => {
            warn!(error = %e, "scheduler run failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct SchedulerPollingBody {
    category: Option<String>,
    automation_id: Option<String>,
}

async fn scheduler_polling(
    State(ctx): State<Arc<AppContext>>,
    body: Option<Json<SchedulerPollingBody>>,
) -> Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let result = if let Some(automation_id) = body.automation_id.as_deref() {
        ctx.poller.run_one_forced(automation_id).await
    } else {
        ctx.poller.run_due_category(body.category.as_deref()).await
    };
    match result {
        Ok(metrics) => Json(json!(metrics)).into_response(),
        Err(e) => {
            warn!(error = %e, "poller run failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ScheduledRunsBody {
    interval: Option<String>,
    user_id: Option<String>,
    limit: Option<usize>,
}

async fn scheduler_scheduled_runs(
    State(ctx): State<Arc<AppContext>>,
    body: Option<Json<ScheduledRunsBody>>,
) -> Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    match ctx.scheduler.scheduled_runs(body.user_id.as_deref()).await {
        Ok(mut runs) => {
            if let Some(interval) = body.interval.as_deref() {
                runs.retain(|r| r.bucket.as_deref() == Some(interval));
            }
            if let Some(limit) = body.limit {
                runs.truncate(limit);
            }
            Json(json!({"runs": runs})).into_response()
        }
        Err(e) => {
            warn!(error = %e, "scheduled-runs introspection failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct TriggerBody {
    automation_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    user_id: Option<String>,
}

async fn scheduler_trigger(State(ctx): State<Arc<AppContext>>, Json(body): Json<TriggerBody>) -> Response {
    match ctx.scheduler.trigger_now(&body.automation_id).await {
        Ok(result) => execution_result_response(result),
        Err(e) => {
            warn!(error = %e, automation_id = %body.automation_id, "manual trigger failed");
            (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

// ─── One-shot execution (§6) ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ExecuteBody {
    automation_id: String,
    #[serde(default)]
    trigger_data: Value,
    /// Accepted but does not change dispatch semantics — a test run still
    /// produces an `ExecutionLog` row so the caller can inspect it the same
    /// way a real run would be inspected (DESIGN.md).
    #[serde(default)]
    #[allow(dead_code)]
    test_mode: bool,
}

async fn execute_automation(State(ctx): State<Arc<AppContext>>, Json(body): Json<ExecuteBody>) -> Response {
    let automation = match ctx.storage.get_automation(&body.automation_id).await {
        Ok(Some(a)) => a,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, Json(json!({"error": "automation not found"}))).into_response()
        }
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response()
        }
    };
    if !automation.is_active() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "automation is not active"})),
        )
            .into_response();
    }
    match ctx
        .dispatcher
        .dispatch_direct(&automation, "manual", &body.trigger_data)
        .await
    {
        Ok(result) => execution_result_response(result),
        Err(e) => {
            warn!(error = %e, automation_id = %body.automation_id, "execute failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

fn execution_result_response(result: crate::engine::ExecutionResult) -> Response {
    let actions: Vec<Value> = result
        .action_results
        .iter()
        .map(|r| {
            let (output, error) = match &r.outcome {
                crate::engine::ActionOutcome::Success(v) => (Some(v.clone()), None),
                crate::engine::ActionOutcome::Skipped => (None, None),
                crate::engine::ActionOutcome::Failed(e) => (None, Some(e.clone())),
                crate::engine::ActionOutcome::Timeout => (None, Some("timed out".to_string())),
                crate::engine::ActionOutcome::UsageLimitExceeded(tool) => {
                    (None, Some(format!("usage limit exceeded for {tool}")))
                }
            };
            json!({
                "action_id": r.action_id,
                "tool": r.tool,
                "status": r.outcome.status_str(),
                "output": output,
                "error": error,
            })
        })
        .collect();

    Json(json!({
        "status": result.status.as_str(),
        "actions_executed": result.actions_executed,
        "actions_failed": result.actions_failed,
        "action_results": actions,
        "error_summary": result.error_summary,
    }))
    .into_response()
}
