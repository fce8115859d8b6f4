// Per-request trace ids.
//
// Clients may pass `trace_id` at the top level of a request or inside its
// params; otherwise one is generated. The id is carried in a task-local so
// engine logs emitted while serving the request can be correlated.

use std::fmt;
use std::future::Future;

use serde_json::Value;
use uuid::Uuid;

const MAX_TRACE_ID_LEN: usize = 64;

tokio::task_local! {
    static TRACE_ID: TraceId;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceId(String);

impl TraceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accepts a client-supplied id made of printable ASCII, at most 64 bytes.
    pub fn parse(candidate: &str) -> Option<Self> {
        let candidate = candidate.trim();
        let acceptable = !candidate.is_empty()
            && candidate.len() <= MAX_TRACE_ID_LEN
            && candidate.bytes().all(|byte| byte.is_ascii_graphic());
        acceptable.then(|| Self(candidate.to_string()))
    }

    /// Trace id carried by a raw JSON-RPC request, or a fresh one.
    pub fn from_raw_request(raw: &[u8]) -> Self {
        serde_json::from_slice::<Value>(raw)
            .ok()
            .and_then(|request| {
                supplied_trace_id(&request)
                    .or_else(|| request.get("params").and_then(supplied_trace_id))
            })
            .unwrap_or_else(Self::generate)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn supplied_trace_id(value: &Value) -> Option<TraceId> {
    value.as_object()?.get("trace_id")?.as_str().and_then(TraceId::parse)
}

pub async fn with_trace_id_scope<F>(trace_id: TraceId, future: F) -> F::Output
where
    F: Future,
{
    TRACE_ID.scope(trace_id, future).await
}

/// Trace id of the request being served by the current task, if any.
pub fn current_trace_id() -> Option<TraceId> {
    TRACE_ID.try_with(Clone::clone).ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn from_json(value: Value) -> TraceId {
        TraceId::from_raw_request(value.to_string().as_bytes())
    }

    #[test]
    fn supplied_ids_are_honoured() {
        let top = from_json(json!({ "jsonrpc": "2.0", "method": "amend.get", "trace_id": "t-1" }));
        assert_eq!(top.as_str(), "t-1");

        let nested = from_json(json!({
            "jsonrpc": "2.0",
            "method": "amend.vote",
            "params": { "trace_id": "vote-42" },
        }));
        assert_eq!(nested.as_str(), "vote-42");
    }

    #[test]
    fn unusable_ids_are_replaced() {
        let spaced = from_json(json!({ "method": "rpc.ping", "trace_id": "has space" }));
        assert!(Uuid::parse_str(spaced.as_str()).is_ok());

        let long = from_json(json!({ "method": "rpc.ping", "trace_id": "x".repeat(65) }));
        assert!(Uuid::parse_str(long.as_str()).is_ok());

        let garbage = TraceId::from_raw_request(b"not json");
        assert!(Uuid::parse_str(garbage.as_str()).is_ok());
    }

    #[tokio::test]
    async fn scope_exposes_current_id() {
        assert_eq!(current_trace_id(), None);
        let trace_id = TraceId::parse("sweep-7").unwrap();
        let seen = with_trace_id_scope(trace_id.clone(), async { current_trace_id() }).await;
        assert_eq!(seen, Some(trace_id));
    }
}
