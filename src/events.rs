use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{
    error::{AppError, Result},
    types::{ContactCreationEvent, Page, PageQuery, StoredEvent},
    AppState,
};

#[derive(Debug, Default)]
pub struct EventStore {
    events: RwLock<Vec<StoredEvent>>,
    next_id: AtomicU64,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persists a delivery batch in a single write; returns how many were stored.
    pub async fn process(&self, events: Vec<ContactCreationEvent>) -> usize {
        let received_at = Utc::now();
        let stored: Vec<StoredEvent> = events
            .into_iter()
            .map(|event| {
                info!(
                    "Processing contact creation event: objectId={:?}, subscriptionType={:?}, attemptNumber={:?}",
                    event.object_id, event.subscription_type, event.attempt_number
                );
                self.to_stored(event, received_at)
            })
            .collect();

        let count = stored.len();
        self.events.write().await.extend(stored);
        info!("{} contact creation events processed", count);
        count
    }

    /// Zero-based page of stored events in arrival order.
    pub async fn list(&self, page_number: usize, size: usize) -> Result<Page<StoredEvent>> {
        if size == 0 {
            return Err(AppError::Validation("size must be positive".into()));
        }

        let events = self.events.read().await;
        let total_elements = events.len();
        let content = events
            .iter()
            .skip(page_number.saturating_mul(size))
            .take(size)
            .cloned()
            .collect();

        Ok(Page {
            content,
            page_number,
            size,
            total_elements,
            total_pages: total_elements.div_ceil(size),
        })
    }

    fn to_stored(&self, event: ContactCreationEvent, received_at: DateTime<Utc>) -> StoredEvent {
        StoredEvent {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            event_id: event.event_id,
            subscription_id: event.subscription_id,
            portal_id: event.portal_id,
            app_id: event.app_id,
            occurred_at: event.occurred_at.and_then(DateTime::from_timestamp_millis),
            subscription_type: event.subscription_type,
            attempt_number: event.attempt_number,
            object_id: event.object_id,
            change_flag: event.change_flag,
            change_source: event.change_source,
            received_at,
        }
    }
}

// POST /webhook/contact (behind the signature middleware)
pub async fn ingest_contact_events(
    State(state): State<AppState>,
    Json(events): Json<Vec<ContactCreationEvent>>,
) -> Result<StatusCode> {
    let store = state.event_store.clone();
    state
        .event_resilience
        .call_or_default(|| async move { Ok(store.process(events).await) })
        .await?;
    Ok(StatusCode::OK)
}

// GET /webhook/contact?pageNumber=&size=
pub async fn list_contact_events(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<StoredEvent>>> {
    if query.size == 0 {
        return Err(AppError::Validation("size must be positive".into()));
    }

    let store = state.event_store.clone();
    let page = state
        .event_resilience
        .call(
            || async move { store.list(query.page_number, query.size).await },
            |err| {
                warn!("Event listing unavailable ({}), rate limit exceeded", err);
                Err(AppError::RateLimited("webhook-events".into()))
            },
        )
        .await?;

    Ok(Json(page))
}
