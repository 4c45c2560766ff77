//! Durable workflow status and progress streaming.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use futures_util::stream;
use tokio::sync::broadcast::{self, error::RecvError};
use workflow::{ProgressEvent, ProgressPublisher, WorkflowSummary};

use super::parse_workflow_id;
use crate::AppState;
use crate::error::ApiError;

/// GET /workflows/{id}
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowSummary>, ApiError> {
    let workflow_id = parse_workflow_id(&id)?;
    Ok(Json(state.engine.status(workflow_id).await?))
}

/// GET /workflows/{id}/progress
///
/// Server-sent events, one per progress event, named after the progress
/// status. The stream ends after the terminal event. A workflow that has
/// already finished yields its terminal event alone.
#[tracing::instrument(skip(state))]
pub async fn progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let workflow_id = parse_workflow_id(&id)?;
    let instance = state.engine.workflow().load(workflow_id).await?;

    let feed = match instance.terminal_progress() {
        Some(last) => Feed::replay(last),
        None => {
            let receiver = state.progress.subscribe(workflow_id);
            // The workflow may have finished between the load and the
            // subscription. Re-publishing its terminal event reaches us and
            // closes the channel we just opened.
            let current = state.engine.workflow().load(workflow_id).await?;
            if let Some(last) = current.terminal_progress()
                && let Err(e) = state.progress.publish(workflow_id, last).await
            {
                tracing::warn!(%workflow_id, error = %e, "failed to replay terminal progress");
            }
            Feed::live(receiver)
        }
    };

    let sse = Sse::new(feed.into_stream());
    Ok(sse.keep_alive(KeepAlive::default()))
}

/// Where a progress stream takes its events from.
struct Feed {
    replay: Option<ProgressEvent>,
    live: Option<broadcast::Receiver<ProgressEvent>>,
}

impl Feed {
    fn replay(event: ProgressEvent) -> Self {
        Self {
            replay: Some(event),
            live: None,
        }
    }

    fn live(receiver: broadcast::Receiver<ProgressEvent>) -> Self {
        Self {
            replay: None,
            live: Some(receiver),
        }
    }

    async fn next(&mut self) -> Option<ProgressEvent> {
        if let Some(event) = self.replay.take() {
            return Some(event);
        }
        let receiver = self.live.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "progress subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn into_stream(self) -> impl Stream<Item = Result<Event, Infallible>> {
        stream::unfold(self, |mut feed| async move {
            match feed.next().await {
                Some(event) => {
                    if event.is_terminal() {
                        feed.live = None;
                    }
                    Some((Ok::<_, Infallible>(to_sse(&event)), feed))
                }
                None => None,
            }
        })
    }
}

fn to_sse(event: &ProgressEvent) -> Event {
    match Event::default().event(event.status.as_str()).json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode progress event");
            Event::default().comment("unencodable progress event")
        }
    }
}
