//! HTTP API v1.
//!
//! Endpoints:
//!
//! - `POST   /v1/turns`                     — Answer a message in a conversation
//! - `POST   /v1/turns/stream`              — Same, answer streamed as SSE
//! - `GET    /v1/conversations/{id}/turns`  — Turn history, oldest first (`skip`, `limit`)
//! - `GET    /v1/notes?owner_id=`           — List an owner's notes (`skip`, `limit`)
//! - `POST   /v1/notes`                     — Create a note
//! - `GET    /v1/notes/{id}`                — Fetch a note
//! - `PUT    /v1/notes/{id}`                — Replace a note's editable fields
//! - `DELETE /v1/notes/{id}`                — Delete a note
//!
//! Turn requests may override `llm_provider`, `llm_model`, `temperature`,
//! `max_tokens` and `rag_enabled` for that turn only.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};

use fastrag_core::error::StoreError;
use fastrag_core::message::{ConversationId, ConversationTurn, OwnerId};
use fastrag_core::note::{Note, NoteUpdate};
use fastrag_core::store::{HistoryStore, NoteStore, Page};
use fastrag_rag::{
    CancelToken, ContextRef, ConversationOrchestrator, TurnError, TurnEvent, TurnOptions,
    TurnOverrides, TurnResponse, TurnResult,
};

// ── State ─────────────────────────────────────────────────────────────────

/// Shared state for the v1 API.
pub struct ApiV1State {
    pub orchestrator: Arc<ConversationOrchestrator>,
    pub history: Arc<dyn HistoryStore>,
    pub notes: Arc<dyn NoteStore>,
    /// Generation deadline for a turn. `None` lets the orchestrator size it
    /// from the provider's retry budget.
    pub turn_timeout: Option<Duration>,
}

pub type SharedApiState = Arc<ApiV1State>;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedApiState) -> Router {
    Router::new()
        .route("/turns", post(turn_handler))
        .route("/turns/stream", post(turn_stream_handler))
        .route("/conversations/{id}/turns", get(list_turns_handler))
        .route("/notes", get(list_notes_handler).post(create_note_handler))
        .route(
            "/notes/{id}",
            get(get_note_handler)
                .put(update_note_handler)
                .delete(delete_note_handler),
        )
        .with_state(state)
}

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Deserialize)]
struct TurnRequest {
    /// Existing conversation ID (omit to start a new one).
    #[serde(default)]
    conversation_id: Option<String>,
    owner_id: String,
    message: String,
    #[serde(flatten)]
    overrides: TurnOverrides,
}

impl TurnRequest {
    fn ids(&self) -> (ConversationId, OwnerId) {
        let conversation_id = match self.conversation_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => ConversationId::from(id),
            _ => ConversationId::new(),
        };
        (conversation_id, OwnerId::from(self.owner_id.trim()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TurnReply {
    conversation_id: String,
    #[serde(flatten)]
    response: TurnResponse,
}

#[derive(Debug, Serialize, Deserialize)]
struct TurnListResponse {
    conversation_id: String,
    turns: Vec<ConversationTurn>,
    count: usize,
}

#[derive(Deserialize)]
struct NoteListQuery {
    owner_id: String,
    #[serde(default)]
    skip: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default)]
    skip: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NoteListResponse {
    notes: Vec<Note>,
    count: usize,
}

#[derive(Deserialize)]
struct CreateNoteRequest {
    owner_id: String,
    title: String,
    body: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    comments: Option<String>,
}

#[derive(Serialize)]
struct DeltaData<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn store_error(e: StoreError) -> ApiError {
    match e {
        StoreError::NotFound(what) => api_error(StatusCode::NOT_FOUND, format!("Not found: {what}")),
        StoreError::OwnerMismatch { .. } => api_error(StatusCode::FORBIDDEN, e.to_string()),
        other => {
            error!(error = %other, "Store request failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

/// HTTP status for a finished turn. The body is the same in every case.
fn turn_status(error: Option<&TurnError>) -> StatusCode {
    match error {
        None | Some(TurnError::PersistenceFailed(_)) => StatusCode::OK,
        Some(TurnError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
        Some(TurnError::ContentRejected(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        Some(TurnError::GenerationFailed(_)) => StatusCode::BAD_GATEWAY,
        Some(TurnError::ProviderTimeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        Some(TurnError::Cancelled) => StatusCode::SERVICE_UNAVAILABLE,
        Some(TurnError::RetrievalFailed(_) | TurnError::BudgetExceeded(_)) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Cancels the turn if the handler future is dropped before it finishes,
/// which is what happens when the client disconnects.
struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn turn_options(state: &ApiV1State, overrides: TurnOverrides, cancel: CancelToken) -> TurnOptions {
    let options = TurnOptions::default()
        .with_overrides(overrides)
        .with_cancel(cancel);
    match state.turn_timeout {
        Some(timeout) => options.with_timeout(timeout),
        None => options,
    }
}

fn finished_reply(conversation_id: &ConversationId, result: &TurnResult) -> (StatusCode, Json<TurnReply>) {
    (
        turn_status(result.error.as_ref()),
        Json(TurnReply {
            conversation_id: conversation_id.to_string(),
            response: TurnResponse::from(result),
        }),
    )
}

/// One streamed turn event as SSE: `context`, `delta` or `done`.
fn sse_event(conversation_id: &ConversationId, event: TurnEvent) -> SseEvent {
    let (name, data) = match event {
        TurnEvent::Context(chunks) => {
            let refs: Vec<ContextRef> = chunks.iter().map(ContextRef::from).collect();
            ("context", serde_json::to_string(&refs))
        }
        TurnEvent::Delta(text) => ("delta", serde_json::to_string(&DeltaData { text: &text })),
        TurnEvent::Finished(result) => {
            let (_, Json(reply)) = finished_reply(conversation_id, &result);
            ("done", serde_json::to_string(&reply))
        }
    };
    SseEvent::default()
        .event(name)
        .data(data.unwrap_or_default())
}

// ── Turn endpoints ────────────────────────────────────────────────────────

async fn turn_handler(
    State(state): State<SharedApiState>,
    Json(req): Json<TurnRequest>,
) -> Result<(StatusCode, Json<TurnReply>), ApiError> {
    let (conversation_id, owner_id) = req.ids();

    info!(
        conversation = %conversation_id,
        owner = %owner_id,
        message_len = req.message.len(),
        "Turn received"
    );

    let cancel = CancelToken::new();
    let _guard = CancelOnDrop(cancel.clone());
    let options = turn_options(&state, req.overrides, cancel);

    // The turn runs on its own task so a dropped connection cancels it
    // cleanly instead of abandoning it mid-persist.
    let orchestrator = state.orchestrator.clone();
    let conv = conversation_id.clone();
    let task = tokio::spawn(async move {
        orchestrator
            .handle_turn_with(&conv, &owner_id, &req.message, options)
            .await
    });
    let result = task.await.map_err(|e| {
        error!(error = %e, "Turn task failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Turn task failed")
    })?;

    Ok(finished_reply(&conversation_id, &result))
}

/// `POST /v1/turns/stream` — answer a message as server-sent events.
///
/// Failures before generation starts come back as the plain JSON reply of
/// `POST /v1/turns`, with its status. Once streaming, the outcome arrives in
/// the final `done` event. Closing the connection cancels the turn.
async fn turn_stream_handler(
    State(state): State<SharedApiState>,
    Json(req): Json<TurnRequest>,
) -> Response {
    let (conversation_id, owner_id) = req.ids();

    info!(
        conversation = %conversation_id,
        owner = %owner_id,
        message_len = req.message.len(),
        "Streaming turn received"
    );

    let cancel = CancelToken::new();
    let guard = CancelOnDrop(cancel.clone());
    let options = turn_options(&state, req.overrides, cancel);
    let mut events = state.orchestrator.handle_turn_streaming(
        conversation_id.clone(),
        owner_id,
        req.message,
        options,
    );

    let first = match events.recv().await {
        Some(TurnEvent::Finished(result)) => {
            return finished_reply(&conversation_id, &result).into_response();
        }
        Some(event) => event,
        None => {
            error!("Turn task ended without a result");
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "Turn task failed").into_response();
        }
    };

    let stream = tokio_stream::once(first)
        .chain(ReceiverStream::new(events))
        .map(move |event| {
            // Dropping the stream drops the guard, cancelling the turn.
            let _guard = &guard;
            Ok::<_, Infallible>(sse_event(&conversation_id, event))
        });
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

async fn list_turns_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<TurnListResponse>, ApiError> {
    let conversation_id = ConversationId::from(id.as_str());
    let turns = state
        .history
        .get_history_page(&conversation_id, Page::new(page.skip, page.limit))
        .await
        .map_err(store_error)?;
    let count = turns.len();
    Ok(Json(TurnListResponse {
        conversation_id: id,
        turns,
        count,
    }))
}

// ── Note endpoints ────────────────────────────────────────────────────────

async fn list_notes_handler(
    State(state): State<SharedApiState>,
    Query(query): Query<NoteListQuery>,
) -> Result<Json<NoteListResponse>, ApiError> {
    let page = Page::new(query.skip, query.limit);
    let notes = state
        .notes
        .list_notes_page(&OwnerId::from(query.owner_id.as_str()), page)
        .await
        .map_err(store_error)?;
    let count = notes.len();
    Ok(Json(NoteListResponse { notes, count }))
}

async fn create_note_handler(
    State(state): State<SharedApiState>,
    Json(req): Json<CreateNoteRequest>,
) -> Result<(StatusCode, Json<Note>), ApiError> {
    if req.owner_id.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "owner_id must not be empty"));
    }
    if req.title.trim().is_empty() && req.body.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "a note needs a title or a body",
        ));
    }

    let mut note = Note::new(OwnerId::from(req.owner_id.trim()), req.title, req.body)
        .with_tags(req.tags);
    if let Some(url) = req.url {
        note = note.with_url(url);
    }
    if let Some(comments) = req.comments {
        note = note.with_comments(comments);
    }
    let created = state.notes.create_note(note).await.map_err(store_error)?;
    info!(note_id = %created.note_id, owner = %created.owner_id, "Note created");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_note_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<Json<Note>, ApiError> {
    state
        .notes
        .get_note(&id)
        .await
        .map_err(store_error)?
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Note '{id}' not found")))
}

async fn update_note_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
    Json(update): Json<NoteUpdate>,
) -> Result<Json<Note>, ApiError> {
    let note = state
        .notes
        .update_note(&id, update)
        .await
        .map_err(store_error)?;
    info!(note_id = %note.note_id, "Note updated");
    Ok(Json(note))
}

async fn delete_note_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<Json<Note>, ApiError> {
    let note = state.notes.delete_note(&id).await.map_err(store_error)?;
    info!(note_id = %note.note_id, "Note deleted");
    Ok(Json(note))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Mutex;
    use tower::ServiceExt;

    use fastrag_core::context::Prompt;
    use fastrag_core::error::ProviderError;
    use fastrag_core::provider::{Answer, Provider, ProviderConfig};
    use fastrag_memory::{EmbeddingIndex, HashEmbedder, InMemoryHistoryStore, InMemoryNoteStore};

    /// Mock provider for gateway tests: answers with fixed text or fails.
    struct MockProvider {
        outcome: Result<String, ProviderError>,
        delay: Duration,
        calls: Mutex<usize>,
        last_config: Mutex<Option<ProviderConfig>>,
    }

    impl MockProvider {
        fn answering(text: &str) -> Self {
            Self {
                outcome: Ok(text.to_string()),
                delay: Duration::ZERO,
                calls: Mutex::new(0),
                last_config: Mutex::new(None),
            }
        }

        fn failing(error: ProviderError) -> Self {
            Self {
                outcome: Err(error),
                delay: Duration::ZERO,
                calls: Mutex::new(0),
                last_config: Mutex::new(None),
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::answering("late")
            }
        }
    }

    #[async_trait::async_trait]
    impl Provider for MockProvider {
        fn name(&self) -> &str {
            "gateway_mock"
        }

        async fn generate(
            &self,
            _prompt: &Prompt,
            config: &ProviderConfig,
        ) -> Result<Answer, ProviderError> {
            *self.calls.lock().unwrap() += 1;
            *self.last_config.lock().unwrap() = Some(config.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.outcome.clone().map(Answer::complete)
        }

        fn max_context_window(&self) -> usize {
            8192
        }
    }

    fn test_api_state_with(provider: MockProvider, turn_timeout: Duration) -> SharedApiState {
        test_api_state_over(Arc::new(provider), Some(turn_timeout))
    }

    fn test_api_state_over(
        provider: Arc<MockProvider>,
        turn_timeout: Option<Duration>,
    ) -> SharedApiState {
        let index = Arc::new(EmbeddingIndex::new(Arc::new(HashEmbedder::new(64))));
        let history = Arc::new(InMemoryHistoryStore::new());
        let notes = Arc::new(InMemoryNoteStore::new());
        let orchestrator = ConversationOrchestrator::new(
            provider,
            ProviderConfig::default(),
            index,
            history.clone(),
        );
        Arc::new(ApiV1State {
            orchestrator: Arc::new(orchestrator),
            history,
            notes,
            turn_timeout,
        })
    }

    fn test_api_state(provider: MockProvider) -> SharedApiState {
        test_api_state_with(provider, Duration::from_secs(30))
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    /// `(event, data)` pairs of an SSE body.
    async fn sse_events(response: axum::response::Response) -> Vec<(String, serde_json::Value)> {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(body.to_vec()).unwrap();
        body.split("\n\n")
            .filter_map(|block| {
                let mut name = None;
                let mut data = None;
                for line in block.lines() {
                    if let Some(value) = line.strip_prefix("event:") {
                        name = Some(value.trim().to_string());
                    } else if let Some(value) = line.strip_prefix("data:") {
                        data = Some(serde_json::from_str(value.trim()).unwrap());
                    }
                }
                Some((name?, data?))
            })
            .collect()
    }

    #[tokio::test]
    async fn turn_answers_and_assigns_conversation() {
        let app = v1_router(test_api_state(MockProvider::answering("4")));

        let response = app
            .oneshot(json_request(
                "POST",
                "/turns",
                serde_json::json!({"owner_id": "alice", "message": "What is 2+2?"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let reply: TurnReply = body_json(response).await;
        assert_eq!(reply.response.answer, "4");
        assert!(reply.response.error.is_none());
        assert!(reply.response.context.is_empty());
        assert!(!reply.conversation_id.is_empty());
    }

    #[tokio::test]
    async fn turn_history_is_listed_in_order() {
        let state = test_api_state(MockProvider::answering("Hi there"));
        let app = v1_router(state.clone());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/turns",
                serde_json::json!({"conversation_id": "c1", "owner_id": "alice", "message": "Hello"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(get("/conversations/c1/turns")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let list: TurnListResponse = body_json(response).await;
        assert_eq!(list.count, 2);
        assert_eq!(list.turns[0].text, "Hello");
        assert_eq!(list.turns[1].text, "Hi there");
    }

    #[tokio::test]
    async fn turn_errors_map_to_statuses() {
        let cases = [
            (
                ProviderError::ContentRejected("policy".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
                "ContentRejected",
            ),
            (
                ProviderError::Unavailable("down".into()),
                StatusCode::BAD_GATEWAY,
                "GenerationFailed",
            ),
            (
                ProviderError::Timeout("slow".into()),
                StatusCode::GATEWAY_TIMEOUT,
                "ProviderTimeout",
            ),
        ];

        for (error, status, kind) in cases {
            let app = v1_router(test_api_state(MockProvider::failing(error)));
            let response = app
                .oneshot(json_request(
                    "POST",
                    "/turns",
                    serde_json::json!({"owner_id": "alice", "message": "hi"}),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), status);

            let reply: TurnReply = body_json(response).await;
            assert_eq!(reply.response.answer, "");
            assert_eq!(reply.response.error.as_deref(), Some(kind));
        }
    }

    #[tokio::test]
    async fn empty_message_is_bad_request() {
        let app = v1_router(test_api_state(MockProvider::answering("unused")));
        let response = app
            .oneshot(json_request(
                "POST",
                "/turns",
                serde_json::json!({"owner_id": "alice", "message": "   "}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let reply: TurnReply = body_json(response).await;
        assert_eq!(reply.response.error.as_deref(), Some("InvalidRequest"));
    }

    #[tokio::test]
    async fn slow_turn_times_out() {
        let state = test_api_state_with(
            MockProvider::slow(Duration::from_secs(5)),
            Duration::from_millis(50),
        );
        let app = v1_router(state.clone());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/turns",
                serde_json::json!({"conversation_id": "slow", "owner_id": "alice", "message": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        // Only the user turn was written.
        let response = app.oneshot(get("/conversations/slow/turns")).await.unwrap();
        let list: TurnListResponse = body_json(response).await;
        assert_eq!(list.count, 1);
    }

    #[tokio::test]
    async fn conversation_of_another_owner_is_rejected() {
        let app = v1_router(test_api_state(MockProvider::answering("ok")));
        let first = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/turns",
                serde_json::json!({"conversation_id": "shared", "owner_id": "alice", "message": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(json_request(
                "POST",
                "/turns",
                serde_json::json!({"conversation_id": "shared", "owner_id": "mallory", "message": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn note_crud() {
        let app = v1_router(test_api_state(MockProvider::answering("unused")));

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/notes",
                serde_json::json!({
                    "owner_id": "alice",
                    "title": "Geography",
                    "body": "Paris is the capital of France",
                    "tags": ["europe"]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: Note = body_json(response).await;
        assert_eq!(created.tags, vec!["europe".to_string()]);

        let response = app
            .clone()
            .oneshot(get("/notes?owner_id=alice"))
            .await
            .unwrap();
        let list: NoteListResponse = body_json(response).await;
        assert_eq!(list.count, 1);

        let uri = format!("/notes/{}", created.note_id);
        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                &uri,
                serde_json::json!({"title": "Geography", "body": "Berlin is the capital of Germany"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let updated: Note = body_json(response).await;
        assert_eq!(updated.body, "Berlin is the capital of Germany");
        assert!(updated.tags.is_empty());

        let response = app.clone().oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(&uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_notes_are_not_found() {
        let app = v1_router(test_api_state(MockProvider::answering("unused")));

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/notes/ghost",
                serde_json::json!({"title": "t", "body": "b"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/notes/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn note_requests_are_validated() {
        let app = v1_router(test_api_state(MockProvider::answering("unused")));

        let response = app.clone().oneshot(get("/notes")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(json_request(
                "POST",
                "/notes",
                serde_json::json!({"owner_id": "", "title": "t", "body": "b"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn turn_overrides_apply_to_that_turn() {
        let provider = Arc::new(MockProvider::answering("ok"));
        let app = v1_router(test_api_state_over(provider.clone(), None));

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/turns",
                serde_json::json!({
                    "conversation_id": "c1",
                    "owner_id": "alice",
                    "message": "hi",
                    "temperature": 1.2,
                    "max_tokens": 200,
                    "rag_enabled": false
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let config = provider.last_config.lock().unwrap().clone().unwrap();
        assert_eq!(config.max_output_tokens, 200);
        assert!((config.temperature - 1.2).abs() < 1e-6);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/turns",
                serde_json::json!({"conversation_id": "c1", "owner_id": "alice", "message": "again"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let config = provider.last_config.lock().unwrap().clone().unwrap();
        assert_eq!(config.max_output_tokens, 1024);

        let response = app.oneshot(get("/conversations/c1/turns")).await.unwrap();
        let list: TurnListResponse = body_json(response).await;
        assert!(list.turns.iter().all(|t| t.llm_provider.as_deref() == Some("claude")));
    }

    #[tokio::test]
    async fn invalid_overrides_are_bad_requests() {
        let provider = Arc::new(MockProvider::answering("unused"));
        let app = v1_router(test_api_state_over(provider.clone(), None));

        for overrides in [
            serde_json::json!({"temperature": 3.0}),
            serde_json::json!({"max_tokens": 0}),
            serde_json::json!({"llm_provider": "openai"}),
        ] {
            let mut body = serde_json::json!({"owner_id": "alice", "message": "hi"});
            body.as_object_mut()
                .unwrap()
                .extend(overrides.as_object().unwrap().clone());
            let response = app.clone().oneshot(json_request("POST", "/turns", body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{overrides}");
        }
        assert_eq!(*provider.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn streamed_turn_sends_context_deltas_and_reply() {
        let state = test_api_state(MockProvider::answering("Paris."));
        let app = v1_router(state.clone());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/turns/stream",
                serde_json::json!({"conversation_id": "s1", "owner_id": "alice", "message": "Capital?"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );

        let events = sse_events(response).await;
        let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["context", "delta", "done"]);
        assert_eq!(events[1].1["text"], "Paris.");
        assert_eq!(events[2].1["answer"], "Paris.");
        assert_eq!(events[2].1["conversation_id"], "s1");
        assert!(events[2].1["error"].is_null());

        let response = app.oneshot(get("/conversations/s1/turns")).await.unwrap();
        let list: TurnListResponse = body_json(response).await;
        assert_eq!(list.count, 2);
        assert_eq!(list.turns[1].text, "Paris.");
    }

    #[tokio::test]
    async fn streamed_turn_failing_early_is_plain_json() {
        let app = v1_router(test_api_state(MockProvider::answering("unused")));
        let response = app
            .oneshot(json_request(
                "POST",
                "/turns/stream",
                serde_json::json!({"owner_id": "alice", "message": " "}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let reply: TurnReply = body_json(response).await;
        assert_eq!(reply.response.error.as_deref(), Some("InvalidRequest"));
    }

    #[tokio::test]
    async fn streamed_generation_failure_arrives_in_done() {
        let app = v1_router(test_api_state(MockProvider::failing(ProviderError::Unavailable(
            "down".into(),
        ))));
        let response = app
            .oneshot(json_request(
                "POST",
                "/turns/stream",
                serde_json::json!({"owner_id": "alice", "message": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let events = sse_events(response).await;
        let (name, data) = events.last().unwrap();
        assert_eq!(name, "done");
        assert_eq!(data["error"], "GenerationFailed");
        assert_eq!(data["answer"], "");
    }

    #[tokio::test]
    async fn listings_take_skip_and_limit() {
        let app = v1_router(test_api_state(MockProvider::answering("ok")));

        for title in ["one", "two", "three"] {
            let response = app
                .clone()
                .oneshot(json_request(
                    "POST",
                    "/notes",
                    serde_json::json!({"owner_id": "alice", "title": title, "body": "text"}),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }
        let response = app
            .clone()
            .oneshot(get("/notes?owner_id=alice&skip=1&limit=1"))
            .await
            .unwrap();
        let list: NoteListResponse = body_json(response).await;
        assert_eq!(list.count, 1);
        let response = app
            .clone()
            .oneshot(get("/notes?owner_id=alice&skip=5"))
            .await
            .unwrap();
        let list: NoteListResponse = body_json(response).await;
        assert_eq!(list.count, 0);

        for message in ["first", "second"] {
            app.clone()
                .oneshot(json_request(
                    "POST",
                    "/turns",
                    serde_json::json!({"conversation_id": "p1", "owner_id": "alice", "message": message}),
                ))
                .await
                .unwrap();
        }
        let response = app
            .oneshot(get("/conversations/p1/turns?skip=2&limit=1"))
            .await
            .unwrap();
        let list: TurnListResponse = body_json(response).await;
        assert_eq!(list.count, 1);
        assert_eq!(list.turns[0].text, "second");
    }

    #[tokio::test]
    async fn notes_keep_url_and_comments() {
        let app = v1_router(test_api_state(MockProvider::answering("unused")));
        let response = app
            .oneshot(json_request(
                "POST",
                "/notes",
                serde_json::json!({
                    "owner_id": "alice",
                    "title": "Trains",
                    "body": "Timetables",
                    "url": "https://example.org/trains",
                    "comments": "check the winter schedule"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let note: Note = body_json(response).await;
        assert_eq!(note.url.as_deref(), Some("https://example.org/trains"));
        assert_eq!(note.comments.as_deref(), Some("check the winter schedule"));
    }

    #[test]
    fn persistence_failure_still_answers() {
        assert_eq!(
            turn_status(Some(&TurnError::PersistenceFailed("disk".into()))),
            StatusCode::OK
        );
        assert_eq!(
            turn_status(Some(&TurnError::Cancelled)),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            turn_status(Some(&TurnError::BudgetExceeded("big".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
