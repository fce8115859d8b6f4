use std::sync::Arc;

use emendare_common::diff::Patch;
use emendare_common::protocol::jsonrpc::{
    Request, RequestId, Response, RpcError, CONFLICT, INTERNAL_ERROR, INVALID_PARAMS,
    INVALID_REQUEST, METHOD_NOT_FOUND, NOT_FOUND, PARSE_ERROR, REJECTED,
};
use emendare_common::protocol::rpc_methods as methods;
use emendare_common::types::{
    AmendmentId, AmendmentStatus, DocumentId, DocumentSummary, UserId, VoteStance,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info_span, warn, Instrument};

use crate::engine::{Engine, EngineError, EngineSettings, NewAmendment};
use crate::notify::NullPublisher;
use crate::rpc::trace::{with_trace_id_scope, TraceId};
use crate::store::MemoryStore;

const DEFAULT_EVENTS_LIMIT: usize = 50;
const MAX_EVENTS_LIMIT: usize = 500;

#[derive(Clone)]
pub struct RpcServerState {
    engine: Engine,
    shutdown_notifier: Option<broadcast::Sender<()>>,
}

impl Default for RpcServerState {
    /// A throwaway in-memory engine.
    fn default() -> Self {
        Self::new(Engine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(NullPublisher),
            EngineSettings::default(),
        ))
    }
}

impl RpcServerState {
    pub fn new(engine: Engine) -> Self {
        Self { engine, shutdown_notifier: None }
    }

    pub fn with_shutdown_notifier(mut self, shutdown_notifier: broadcast::Sender<()>) -> Self {
        self.shutdown_notifier = Some(shutdown_notifier);
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

// ── Params ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UserCreateParams {
    name: String,
}

#[derive(Debug, Deserialize)]
struct UserDeleteParams {
    user_id: UserId,
}

#[derive(Debug, Deserialize)]
struct DocCreateParams {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct DocGetParams {
    document_id: DocumentId,
}

#[derive(Debug, Deserialize)]
struct DocFollowParams {
    user_id: UserId,
    document_id: DocumentId,
}

#[derive(Debug, Deserialize)]
struct DocAmendmentsParams {
    document_id: DocumentId,
    #[serde(default)]
    status: Option<AmendmentStatus>,
}

#[derive(Debug, Deserialize)]
struct DocAtVersionParams {
    document_id: DocumentId,
    version: usize,
}

#[derive(Debug, Deserialize)]
struct AmendProposeParams {
    document_id: DocumentId,
    author_id: UserId,
    name: String,
    #[serde(default)]
    description: String,
    base_version: usize,
    patch: Patch,
    #[serde(default)]
    delay_min_sec: Option<u64>,
    #[serde(default)]
    delay_max_sec: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AmendmentParams {
    amendment_id: AmendmentId,
}

#[derive(Debug, Deserialize)]
struct AmendVoteParams {
    amendment_id: AmendmentId,
    user_id: UserId,
    stance: VoteStance,
}

#[derive(Debug, Deserialize)]
struct EventsListParams {
    #[serde(default = "default_events_limit")]
    limit: usize,
}

fn default_events_limit() -> usize {
    DEFAULT_EVENTS_LIMIT
}

// ── Dispatch ───────────────────────────────────────────────────────

pub async fn handle_raw_request(raw: &[u8], state: &RpcServerState) -> Response {
    let request = match serde_json::from_slice::<Request>(raw) {
        Ok(request) => request,
        Err(error) => {
            return Response::error(
                RequestId::Null,
                RpcError {
                    code: PARSE_ERROR,
                    message: "Parse error".to_string(),
                    data: Some(json!({ "reason": error.to_string() })),
                },
            );
        }
    };

    if request.jsonrpc != "2.0" {
        return Response::error(
            request.id,
            RpcError { code: INVALID_REQUEST, message: "Invalid Request".to_string(), data: None },
        );
    }

    let trace_id = TraceId::from_raw_request(raw);
    let span = info_span!("rpc.request", method = %request.method, trace_id = %trace_id);
    with_trace_id_scope(trace_id, dispatch_request(request, state).instrument(span)).await
}

pub async fn dispatch_request(request: Request, state: &RpcServerState) -> Response {
    match request.method.as_str() {
        methods::RPC_PING => Response::success(request.id, json!({ "ok": true })),
        methods::DAEMON_SHUTDOWN => {
            if let Some(notifier) = &state.shutdown_notifier {
                let _ = notifier.send(());
            }
            Response::success(request.id, json!({ "ok": true }))
        }
        methods::USER_CREATE => handle_user_create(request, state).await,
        methods::USER_DELETE => handle_user_delete(request, state).await,
        methods::DOC_CREATE => handle_doc_create(request, state).await,
        methods::DOC_GET => handle_doc_get(request, state).await,
        methods::DOC_FOLLOW => handle_doc_follow(request, state, true).await,
        methods::DOC_UNFOLLOW => handle_doc_follow(request, state, false).await,
        methods::DOC_AMENDMENTS => handle_doc_amendments(request, state).await,
        methods::DOC_AT_VERSION => handle_doc_at_version(request, state).await,
        methods::AMEND_PROPOSE => handle_amend_propose(request, state).await,
        methods::AMEND_GET => handle_amend_get(request, state).await,
        methods::AMEND_VOTE => handle_amend_vote(request, state).await,
        methods::AMEND_PREVIEW => handle_amend_preview(request, state).await,
        methods::EVENTS_LIST => handle_events_list(request, state).await,
        _ => Response::error(
            request.id,
            RpcError {
                code: METHOD_NOT_FOUND,
                message: "Method not found".to_string(),
                data: None,
            },
        ),
    }
}

// ── Handlers ───────────────────────────────────────────────────────

async fn handle_user_create(request: Request, state: &RpcServerState) -> Response {
    let params: UserCreateParams = match parse_params(&request) {
        Ok(params) => params,
        Err(response) => return response,
    };
    respond(request.id, state.engine.create_user(&params.name).await)
}

async fn handle_user_delete(request: Request, state: &RpcServerState) -> Response {
    let params: UserDeleteParams = match parse_params(&request) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let result = state.engine.delete_user(params.user_id).await.map(|()| json!({ "ok": true }));
    respond(request.id, result)
}

async fn handle_doc_create(request: Request, state: &RpcServerState) -> Response {
    let params: DocCreateParams = match parse_params(&request) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let result = state
        .engine
        .create_document(&params.title, &params.description, &params.body)
        .await
        .map(|document| DocumentSummary::from(&document));
    respond(request.id, result)
}

async fn handle_doc_get(request: Request, state: &RpcServerState) -> Response {
    let params: DocGetParams = match parse_params(&request) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let result = state
        .engine
        .get_document(params.document_id)
        .await
        .map(|document| DocumentSummary::from(&document));
    respond(request.id, result)
}

async fn handle_doc_follow(request: Request, state: &RpcServerState, follow: bool) -> Response {
    let params: DocFollowParams = match parse_params(&request) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let result = if follow {
        state.engine.follow(params.user_id, params.document_id).await
    } else {
        state.engine.unfollow(params.user_id, params.document_id).await
    };
    respond(request.id, result.map(|document| DocumentSummary::from(&document)))
}

async fn handle_doc_amendments(request: Request, state: &RpcServerState) -> Response {
    let params: DocAmendmentsParams = match parse_params(&request) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let result = state.engine.document_amendments(params.document_id).await.map(|amendments| {
        amendments
            .into_iter()
            .filter(|amendment| params.status.map_or(true, |status| amendment.status() == status))
            .collect::<Vec<_>>()
    });
    respond(request.id, result)
}

async fn handle_doc_at_version(request: Request, state: &RpcServerState) -> Response {
    let params: DocAtVersionParams = match parse_params(&request) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let result = state.engine.document_at(params.document_id, params.version).await.map(|body| {
        json!({ "document_id": params.document_id, "version": params.version, "body": body })
    });
    respond(request.id, result)
}

async fn handle_amend_propose(request: Request, state: &RpcServerState) -> Response {
    let params: AmendProposeParams = match parse_params(&request) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let proposal = NewAmendment {
        document_id: params.document_id,
        author_id: params.author_id,
        name: params.name,
        description: params.description,
        base_version: params.base_version,
        patch: params.patch,
        delay_min_sec: params.delay_min_sec,
        delay_max_sec: params.delay_max_sec,
    };
    respond(request.id, state.engine.propose_amendment(proposal).await)
}

async fn handle_amend_get(request: Request, state: &RpcServerState) -> Response {
    let params: AmendmentParams = match parse_params(&request) {
        Ok(params) => params,
        Err(response) => return response,
    };
    respond(request.id, state.engine.get_amendment(params.amendment_id).await)
}

async fn handle_amend_vote(request: Request, state: &RpcServerState) -> Response {
    let params: AmendVoteParams = match parse_params(&request) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let result = state.engine.cast_vote(params.amendment_id, params.user_id, params.stance).await;
    respond(request.id, result)
}

async fn handle_amend_preview(request: Request, state: &RpcServerState) -> Response {
    let params: AmendmentParams = match parse_params(&request) {
        Ok(params) => params,
        Err(response) => return response,
    };
    respond(request.id, state.engine.amendment_preview(params.amendment_id).await)
}

async fn handle_events_list(request: Request, state: &RpcServerState) -> Response {
    let params = match request.params.clone() {
        None => EventsListParams { limit: DEFAULT_EVENTS_LIMIT },
        Some(_) => match parse_params::<EventsListParams>(&request) {
            Ok(params) => params,
            Err(response) => return response,
        },
    };
    let limit = params.limit.min(MAX_EVENTS_LIMIT);
    respond(request.id, state.engine.list_events(limit).await)
}

// ── Helpers ────────────────────────────────────────────────────────

fn parse_params<T: DeserializeOwned>(request: &Request) -> Result<T, Response> {
    let Some(params) = request.params.clone() else {
        return Err(invalid_params_response(
            request.id.clone(),
            format!("{} requires params", request.method),
        ));
    };

    serde_json::from_value::<T>(params).map_err(|error| {
        invalid_params_response(
            request.id.clone(),
            format!("failed to decode {} params: {error}", request.method),
        )
    })
}

fn respond<T: serde::Serialize>(request_id: RequestId, result: Result<T, EngineError>) -> Response {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => Response::success(request_id, value),
            Err(error) => Response::error(
                request_id,
                RpcError::new(INTERNAL_ERROR, format!("failed to encode result: {error}")),
            ),
        },
        Err(error) => engine_error_response(request_id, &error),
    }
}

fn engine_error_response(request_id: RequestId, error: &EngineError) -> Response {
    let code = match error {
        EngineError::NotFound { .. } => NOT_FOUND,
        EngineError::InvalidRequest(_) => INVALID_PARAMS,
        EngineError::NotEligible { .. } | EngineError::History(_) => REJECTED,
        EngineError::AlreadyClosed(_)
        | EngineError::AlreadyVoted { .. }
        | EngineError::StaleVersion { .. }
        | EngineError::MergeConflict(_)
        | EngineError::AlreadyFollowing { .. }
        | EngineError::NotFollowing { .. } => CONFLICT,
        EngineError::Storage(_) if error.is_conflict() => CONFLICT,
        EngineError::Storage(_) => INTERNAL_ERROR,
    };
    if code == INTERNAL_ERROR {
        warn!(%error, "rpc request failed in storage");
    }

    Response::error(
        request_id,
        RpcError::new(code, error.to_string())
            .with_data(json!({ "code": error.code(), "retryable": error.retryable() })),
    )
}

fn invalid_params_response(request_id: RequestId, reason: String) -> Response {
    Response::error(
        request_id,
        RpcError {
            code: INVALID_PARAMS,
            message: "Invalid params".to_string(),
            data: Some(json!({ "reason": reason })),
        },
    )
}

#[cfg(test)]
mod tests {
    use emendare_common::diff;
    use emendare_common::types::{Amendment, User};

    use super::*;

    async fn call(state: &RpcServerState, method: &str, params: Value) -> Response {
        let raw = json!({ "jsonrpc": "2.0", "method": method, "params": params, "id": 1 });
        handle_raw_request(raw.to_string().as_bytes(), state).await
    }

    async fn call_ok<T: DeserializeOwned>(state: &RpcServerState, method: &str, params: Value) -> T {
        let response = call(state, method, params).await;
        let result = response.into_result().expect("call should succeed");
        serde_json::from_value(result).expect("result should decode")
    }

    #[tokio::test]
    async fn malformed_json_is_parse_error() {
        let response = handle_raw_request(b"{not json", &RpcServerState::default()).await;
        assert_eq!(response.id, RequestId::Null);
        assert_eq!(response.error.unwrap().code, PARSE_ERROR);
    }

    #[tokio::test]
    async fn wrong_version_is_invalid_request() {
        let raw = json!({ "jsonrpc": "1.0", "method": "rpc.ping", "id": 3 });
        let response =
            handle_raw_request(raw.to_string().as_bytes(), &RpcServerState::default()).await;
        assert_eq!(response.error.unwrap().code, INVALID_REQUEST);
    }

    #[tokio::test]
    async fn missing_params_are_reported() {
        let state = RpcServerState::default();
        let raw = json!({ "jsonrpc": "2.0", "method": "amend.vote", "id": 4 });
        let response = handle_raw_request(raw.to_string().as_bytes(), &state).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, INVALID_PARAMS);
        assert!(error.data.unwrap()["reason"].as_str().unwrap().contains("requires params"));

        let response = call(&state, "amend.vote", json!({ "stance": "sideways" })).await;
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn shutdown_notifies_listener() {
        let (tx, mut rx) = tokio::sync::broadcast::channel(1);
        let state = RpcServerState::default().with_shutdown_notifier(tx);
        let response = call(&state, "daemon.shutdown", json!({})).await;
        assert!(response.error.is_none());
        rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn voting_flow_over_rpc() {
        let state = RpcServerState::default();
        let user: User = call_ok(&state, "user.create", json!({ "name": "ada" })).await;
        let document: DocumentSummary = call_ok(
            &state,
            "doc.create",
            json!({ "title": "Charter", "body": "Dues are ten." }),
        )
        .await;
        assert_eq!(document.version, 1);

        let amendment: Amendment = call_ok(
            &state,
            "amend.propose",
            json!({
                "document_id": document.id,
                "author_id": user.id,
                "name": "cheaper dues",
                "base_version": 1,
                "patch": diff::diff("Dues are ten.", "Dues are five."),
            }),
        )
        .await;

        let outsider = call(
            &state,
            "amend.vote",
            json!({ "amendment_id": amendment.id, "user_id": user.id, "stance": "up" }),
        )
        .await;
        let error = outsider.error.unwrap();
        assert_eq!(error.code, REJECTED);
        assert_eq!(error.error_code(), Some("NOT_ELIGIBLE"));
        assert!(!error.is_retryable());

        let followed: DocumentSummary = call_ok(
            &state,
            "doc.follow",
            json!({ "user_id": user.id, "document_id": document.id }),
        )
        .await;
        assert_eq!(followed.followers_count, 1);

        let voted: Amendment = call_ok(
            &state,
            "amend.vote",
            json!({ "amendment_id": amendment.id, "user_id": user.id, "stance": "up" }),
        )
        .await;
        assert_eq!((voted.id, voted.up_votes_count), (amendment.id, 1));

        let open: Vec<Amendment> = call_ok(
            &state,
            "doc.amendments",
            json!({ "document_id": document.id, "status": "open" }),
        )
        .await;
        assert_eq!(open.len(), 1);

        let at_zero: Value =
            call_ok(&state, "doc.at_version", json!({ "document_id": document.id, "version": 0 }))
                .await;
        assert_eq!(at_zero["body"], "");

        let events: Vec<Value> = call_ok(&state, "events.list", json!({ "limit": 1 })).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["kind"], "amendment_proposed");
    }

    #[tokio::test]
    async fn unknown_ids_map_to_not_found() {
        let state = RpcServerState::default();
        let response =
            call(&state, "amend.get", json!({ "amendment_id": uuid::Uuid::new_v4() })).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, NOT_FOUND);
        assert_eq!(error.error_code(), Some("NOT_FOUND"));
    }

    #[tokio::test]
    async fn future_version_is_rejected() {
        let state = RpcServerState::default();
        let document: DocumentSummary =
            call_ok(&state, "doc.create", json!({ "title": "Charter", "body": "x" })).await;
        let response =
            call(&state, "doc.at_version", json!({ "document_id": document.id, "version": 9 }))
                .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, REJECTED);
        assert_eq!(error.error_code(), Some("HISTORY_UNAVAILABLE"));
    }
}
