use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post, put},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::api::health::HealthState;
use crate::config::DEFAULT_LIST_LIMIT;
use crate::db::models::{CurrentStateRow, DeadLetterRow, NotificationRow, ScanJobRow, ScanResultRow};
use crate::db::scans::CancelOutcome;
use crate::db::{NotificationStore, ScanStore};
use crate::error::AppError;
use crate::governor::{ClassUsage, RateGovernor};
use crate::ingest::{ChannelSender, QueueMessage};
use crate::scan::{
    ClassLatency, ScanCreated, ScanFilter, ScanOrchestrator, ScanProgress, ScanRequest, ScanSource,
    ScanStatus,
};
use crate::types::{sort_for_display, ItemKey, Severity};

const MAX_LIST_LIMIT: i64 = 1_000;
const MAX_CATALOG_BATCH: usize = 10_000;

#[derive(Clone)]
pub struct ApiState {
    pub notifications: NotificationStore,
    pub scans: ScanStore,
    pub orchestrator: Arc<ScanOrchestrator>,
    pub intake: ChannelSender,
    pub governor: Arc<RateGovernor>,
    pub health: Arc<HealthState>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/scan", post(create_scan))
        .route("/scan/:id", get(get_scan))
        .route("/scan/:id/cancel", post(cancel_scan))
        .route("/scan/:id/results", get(get_scan_results))
        .route("/scan/:id/events", get(scan_events))
        .route("/catalog", put(put_catalog))
        .route("/notifications", post(receive_notification))
        .route("/notifications/:message_id", get(get_notification))
        .route("/current-state", get(get_current_state))
        .route("/current-state/:marketplace/:item_id", get(get_item_state))
        .route("/dead-letters", get(get_dead_letters))
        .route("/dead-letters/:message_id", get(get_dead_letter))
        .route("/dead-letters/:message_id/replay", post(replay_dead_letter))
        .route("/health", get(get_health))
        .route("/stats/latency", get(get_stats_latency))
        .route("/stats/governor", get(get_stats_governor))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanBody {
    pub source: String,
    pub filter_type: Option<String>,
    pub max_items: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItemBody {
    pub item_id: String,
    pub marketplace: String,
    #[serde(default = "active_by_default")]
    pub active: bool,
}

fn active_by_default() -> bool {
    true
}

#[derive(Deserialize)]
pub struct CatalogBody {
    pub items: Vec<CatalogItemBody>,
}

#[derive(Deserialize)]
pub struct CurrentStateQuery {
    pub severity: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub message_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    /// Seconds since startup.
    pub uptime: u64,
    pub timestamp: String,
    pub messages_handled: u64,
}

#[derive(Debug, Serialize)]
pub struct CatalogResponse {
    pub upserted: u64,
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

// ---------------------------------------------------------------------------
// Scan handlers
// ---------------------------------------------------------------------------

async fn create_scan(
    State(state): State<ApiState>,
    Json(body): Json<ScanBody>,
) -> Result<Json<ScanCreated>, AppError> {
    let req = ScanRequest {
        source: ScanSource::parse(&body.source)?,
        filter: ScanFilter::parse(body.filter_type.as_deref())?,
        max_items: body.max_items,
    };
    let created = state.orchestrator.submit(req).await?;
    Ok(Json(created))
}

async fn get_scan(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<ScanJobRow>, AppError> {
    let job = state
        .scans
        .get_job(&job_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("scan job {job_id}")))?;
    Ok(Json(job))
}

async fn cancel_scan(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<MessageResponse>, AppError> {
    let message = match state.orchestrator.cancel(&job_id).await? {
        CancelOutcome::Requested => "cancellation requested".to_string(),
        CancelOutcome::AlreadyTerminal(status) => format!("job already {status}"),
        CancelOutcome::NotFound => return Err(AppError::NotFound(format!("scan job {job_id}"))),
    };
    Ok(Json(MessageResponse { message }))
}

async fn get_scan_results(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<Vec<ScanResultRow>>, AppError> {
    if state.scans.get_job(&job_id).await?.is_none() {
        return Err(AppError::NotFound(format!("scan job {job_id}")));
    }
    let rows = state.scans.list_results(&job_id).await?;
    Ok(Json(rows))
}

/// What an SSE stream still has to deliver.
struct EventFeed {
    pending: Option<ScanProgress>,
    rx: Option<broadcast::Receiver<ScanProgress>>,
}

fn to_event(progress: &ScanProgress) -> Event {
    Event::default()
        .event(progress.name())
        .json_data(progress)
        .unwrap_or_else(|_| Event::default().event(progress.name()))
}

async fn scan_events(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let feed = match state.orchestrator.subscribe(&job_id) {
        Some(rx) => EventFeed {
            pending: None,
            rx: Some(rx),
        },
        None => {
            // Not live any more: replay the final state once.
            let job = state
                .scans
                .get_job(&job_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("scan job {job_id}")))?;
            EventFeed {
                pending: Some(ScanProgress::Finished {
                    status: ScanStatus::parse(&job.status).unwrap_or(ScanStatus::Failed),
                    succeeded: job.successful_items as u64,
                    failed: job.failed_items as u64,
                    job_id: job.id,
                }),
                rx: None,
            }
        }
    };

    let stream = stream::unfold(feed, |mut feed| async move {
        if let Some(progress) = feed.pending.take() {
            return Some((Ok::<_, Infallible>(to_event(&progress)), feed));
        }
        let rx = feed.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(progress) => return Some((Ok::<_, Infallible>(to_event(&progress)), feed)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "scan event subscriber lagging");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

async fn put_catalog(
    State(state): State<ApiState>,
    Json(body): Json<CatalogBody>,
) -> Result<Json<CatalogResponse>, AppError> {
    if body.items.len() > MAX_CATALOG_BATCH {
        return Err(AppError::BadRequest(format!(
            "at most {MAX_CATALOG_BATCH} catalog items per request"
        )));
    }
    let mut entries = Vec::with_capacity(body.items.len());
    for item in body.items {
        let (item_id, marketplace) = (item.item_id.trim(), item.marketplace.trim());
        if item_id.is_empty() || marketplace.is_empty() {
            return Err(AppError::BadRequest(
                "catalog items need itemId and marketplace".to_string(),
            ));
        }
        let key = ItemKey {
            item_id: item_id.to_string(),
            marketplace: marketplace.to_string(),
        };
        entries.push((key, item.active));
    }

    let upserted = state.scans.upsert_catalog(&entries).await?;
    Ok(Json(CatalogResponse { upserted }))
}

// ---------------------------------------------------------------------------
// Ingestion and state handlers
// ---------------------------------------------------------------------------

async fn receive_notification(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<AcceptedResponse>), AppError> {
    let message_id = headers
        .get("x-message-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::BadRequest("missing x-message-id header".to_string()))?
        .to_string();

    let mut attributes = HashMap::new();
    if let Some(ct) = headers.get("content-type").and_then(|v| v.to_str().ok()) {
        attributes.insert("content-type".to_string(), ct.to_string());
    }

    state
        .intake
        .send(QueueMessage {
            message_id: message_id.clone(),
            body: body.to_vec(),
            attributes,
        })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { message_id })))
}

async fn get_notification(
    State(state): State<ApiState>,
    Path(message_id): Path<String>,
) -> Result<Json<NotificationRow>, AppError> {
    let row = state
        .notifications
        .get_by_message_id(&message_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("notification {message_id}")))?;
    Ok(Json(row))
}

async fn get_current_state(
    State(state): State<ApiState>,
    Query(params): Query<CurrentStateQuery>,
) -> Result<Json<Vec<CurrentStateRow>>, AppError> {
    let min_severity = match params.severity.as_deref() {
        None | Some("") => None,
        Some(s) => Some(
            Severity::parse(s)
                .ok_or_else(|| AppError::BadRequest(format!("unknown severity: {s}")))?,
        ),
    };

    let mut rows = state
        .notifications
        .list_current_state(min_severity, clamp_limit(params.limit))
        .await?;
    sort_for_display(&mut rows, |r| {
        Severity::parse(&r.severity).unwrap_or(Severity::Info)
    });
    Ok(Json(rows))
}

async fn get_item_state(
    State(state): State<ApiState>,
    Path((marketplace, item_id)): Path<(String, String)>,
) -> Result<Json<CurrentStateRow>, AppError> {
    let key = ItemKey {
        item_id,
        marketplace,
    };
    let row = state
        .notifications
        .get_current_state(&key)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("current state for {key}")))?;
    Ok(Json(row))
}

async fn get_dead_letters(
    State(state): State<ApiState>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<Vec<DeadLetterRow>>, AppError> {
    let rows = state
        .notifications
        .list_dead_letters(clamp_limit(params.limit))
        .await?;
    Ok(Json(rows))
}

async fn get_dead_letter(
    State(state): State<ApiState>,
    Path(message_id): Path<String>,
) -> Result<Json<DeadLetterRow>, AppError> {
    let row = state
        .notifications
        .get_dead_letter(&message_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("dead letter {message_id}")))?;
    Ok(Json(row))
}

/// Push the stored bytes of a dead letter back onto the intake queue under its
/// original message id.
async fn replay_dead_letter(
    State(state): State<ApiState>,
    Path(message_id): Path<String>,
) -> Result<(StatusCode, Json<AcceptedResponse>), AppError> {
    let dead = state
        .notifications
        .get_dead_letter(&message_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("dead letter {message_id}")))?;

    let attributes = HashMap::from([("replayed-from".to_string(), "dead-letters".to_string())]);
    state
        .intake
        .send(QueueMessage {
            message_id: dead.message_id.clone(),
            body: dead.body()?,
            attributes,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            message_id: dead.message_id,
        }),
    ))
}

// ---------------------------------------------------------------------------
// Ops
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    let healthy = state.health.ingest_alive();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" },
            uptime: state.health.uptime_secs(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            messages_handled: state.health.messages_handled(),
        }),
    )
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<Vec<ClassLatency>> {
    Json(state.orchestrator.latency().snapshot())
}

async fn get_stats_governor(State(state): State<ApiState>) -> Json<Vec<ClassUsage>> {
    Json(state.governor.usage().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::ingest::queue::MessageSource;
    use crate::ingest::ChannelSource;
    use crate::pool::RetryPolicy;
    use crate::scan::{HttpPricingClient, ScanSettings};
    use axum::http::HeaderValue;
    use axum::response::IntoResponse;

    async fn test_state() -> (ApiState, ChannelSource) {
        let pool = memory_pool().await;
        let client =
            HttpPricingClient::new("http://127.0.0.1:9", None, Duration::from_secs(1)).unwrap();
        let governor = RateGovernor::new(vec![("item_offers".to_string(), 0)], 0);
        let orchestrator = ScanOrchestrator::new(
            ScanStore::new(pool.clone()),
            Arc::new(client),
            Arc::clone(&governor),
            ScanSettings {
                batch_size: 10,
                concurrency: 1,
                cooldown: Duration::ZERO,
                api_class: "item_offers".to_string(),
                retry: RetryPolicy::default(),
            },
        );
        let (intake, source) = ChannelSource::new(4);
        let state = ApiState {
            notifications: NotificationStore::new(pool.clone()),
            scans: ScanStore::new(pool),
            orchestrator,
            intake,
            governor,
            health: Arc::new(HealthState::new()),
        };
        (state, source)
    }

    #[tokio::test]
    async fn health_reflects_ingest_loop() {
        let (state, _source) = test_state().await;
        let (code, Json(body)) = get_health(State(state.clone())).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.status, "unhealthy");

        state.health.set_ingest_alive(true);
        state.health.inc_messages_handled();
        let (code, Json(body)) = get_health(State(state)).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.status, "healthy");
        assert_eq!(body.messages_handled, 1);
    }

    #[tokio::test]
    async fn intake_requires_message_id() {
        let (state, source) = test_state().await;
        let err = receive_notification(State(state.clone()), HeaderMap::new(), Bytes::from("{}"))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let mut headers = HeaderMap::new();
        headers.insert("x-message-id", HeaderValue::from_static("m-1"));
        let (code, _) = receive_notification(State(state), headers, Bytes::from("{}"))
            .await
            .unwrap();
        assert_eq!(code, StatusCode::ACCEPTED);

        let batch = source.receive(10).await.unwrap();
        assert_eq!(batch[0].message_id, "m-1");
    }

    #[tokio::test]
    async fn unknown_inputs_are_rejected() {
        let (state, _source) = test_state().await;

        let err = get_current_state(
            State(state.clone()),
            Query(CurrentStateQuery {
                severity: Some("apocalyptic".into()),
                limit: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let err = create_scan(
            State(state.clone()),
            Json(ScanBody {
                source: "everything".into(),
                filter_type: None,
                max_items: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let err = cancel_scan(State(state.clone()), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let err = get_scan(State(state.clone()), Path("nope".to_string())).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let err = get_notification(State(state.clone()), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let err = get_item_state(State(state), Path(("US".to_string(), "B001".to_string())))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dead_letter_lookup_by_message_id() {
        let (state, _source) = test_state().await;
        state
            .notifications
            .record_dead_letter("m-7", b"not json", "validation", "bad body")
            .await
            .unwrap();

        let Json(row) = get_dead_letter(State(state.clone()), Path("m-7".to_string()))
            .await
            .unwrap();
        assert_eq!(row.error_type, "validation");
        assert_eq!(row.failure_count, 1);

        let err = get_dead_letter(State(state), Path("m-8".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn governor_stats_list_configured_classes() {
        let (state, _source) = test_state().await;
        state.governor.acquire("item_offers").await;
        let Json(usage) = get_stats_governor(State(state)).await;
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].api_class, "item_offers");
        assert_eq!(usage[0].request_count, 1);
    }

    #[tokio::test]
    async fn empty_scan_completes_in_background() {
        let (state, _source) = test_state().await;
        let Json(created) = create_scan(
            State(state.clone()),
            Json(ScanBody {
                source: "catalog".into(),
                filter_type: Some("all".into()),
                max_items: Some(10),
            }),
        )
        .await
        .unwrap();
        assert_eq!(created.total_items, 0);
        assert_eq!(created.estimated_duration, 0);

        let mut status = String::new();
        for _ in 0..100 {
            let Json(job) = get_scan(State(state.clone()), Path(created.job_id.clone()))
                .await
                .unwrap();
            status = job.status;
            if status == "completed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, "completed");
    }

    #[tokio::test]
    async fn replay_requeues_the_original_bytes() {
        let (state, source) = test_state().await;
        let body = vec![0xffu8, b'{', 0x01];
        state
            .notifications
            .record_dead_letter("m-9", &body, "malformed", "not utf-8")
            .await
            .unwrap();

        let (code, Json(accepted)) = replay_dead_letter(State(state.clone()), Path("m-9".to_string()))
            .await
            .unwrap();
        assert_eq!(code, StatusCode::ACCEPTED);
        assert_eq!(accepted.message_id, "m-9");

        let batch = source.receive(10).await.unwrap();
        assert_eq!(batch[0].message_id, "m-9");
        assert_eq!(batch[0].body, body);

        let err = replay_dead_letter(State(state), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn catalog_intake_feeds_catalog_scans() {
        let (state, _source) = test_state().await;
        let Json(resp) = put_catalog(
            State(state.clone()),
            Json(CatalogBody {
                items: vec![
                    CatalogItemBody {
                        item_id: "B001".into(),
                        marketplace: "US".into(),
                        active: true,
                    },
                    CatalogItemBody {
                        item_id: "B002".into(),
                        marketplace: "US".into(),
                        active: false,
                    },
                ],
            }),
        )
        .await
        .unwrap();
        assert_eq!(resp.upserted, 2);

        let targets = state
            .scans
            .resolve_targets(ScanSource::Catalog, ScanFilter::All, None)
            .await
            .unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].item_id, "B001");

        let err = put_catalog(
            State(state),
            Json(CatalogBody {
                items: vec![CatalogItemBody {
                    item_id: " ".into(),
                    marketplace: "US".into(),
                    active: true,
                }],
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn catalog_items_default_to_active() {
        let body: CatalogBody =
            serde_json::from_str(r#"{"items":[{"itemId":"B001","marketplace":"US"}]}"#).unwrap();
        assert!(body.items[0].active);
    }
}
