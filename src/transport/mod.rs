//! gRPC transport layer.
//!
//! Tagged unions (values, templates, facts) cross the wire as serde-JSON
//! bytes inside the proto envelope; the proto layer carries framing,
//! scalar results, and call correlation for the analyzer stream.
//!
//! The `Analyzer` RPC is a bidirectional stream: the client's first message
//! registers the analyzer, after which the server pushes one
//! `AnalyzeRequest` per new premise binding and the client answers each by
//! `call_id`. The server never closes its side; the call hangs for the
//! life of the process, which is the registration contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use crate::analyzer::Analysis;
use crate::engine::StrataEngine;
use crate::error::{AnalysisError, StorageError, StrataError};
use crate::fact::{Context, Fact, FactTemplate};
use crate::value::ValueType;

pub mod proto {
    #![allow(missing_docs)]
    tonic::include_proto!("strata");
}

use proto::strata_service_server::{StrataService, StrataServiceServer};

// ----------------------------------------------------------------------------
// Limits (DoS protection)
// ----------------------------------------------------------------------------

/// Maximum size of any inbound JSON payload.
const MAX_REQUEST_JSON_BYTES: usize = 4 * 1024 * 1024; // 4 MiB

/// Maximum size of a serialized context list.
const MAX_RESPONSE_JSON_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

/// Buffered analyze requests per analyzer stream before dispatch blocks.
const ANALYZE_STREAM_CAPACITY: usize = 128;

/// Schema-registration payload: `{"name": .., "arg_types": [..]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDecl {
    /// Predicate name.
    pub name: String,
    /// Ordered argument types.
    pub arg_types: Vec<ValueType>,
}

/// gRPC service implementation.
pub struct StrataServiceImpl {
    engine: Arc<StrataEngine>,
}

impl StrataServiceImpl {
    #[must_use]
    pub fn new(engine: Arc<StrataEngine>) -> Self {
        Self { engine }
    }

    #[must_use]
    pub fn into_server(self) -> StrataServiceServer<Self> {
        StrataServiceServer::new(self)
    }
}

fn invalid_argument(msg: impl Into<String>) -> Status {
    Status::invalid_argument(msg.into())
}

fn parse_json<T: serde::de::DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T, Status> {
    if bytes.is_empty() {
        return Err(invalid_argument(format!("{what} is required")));
    }
    if bytes.len() > MAX_REQUEST_JSON_BYTES {
        return Err(invalid_argument(format!("{what} exceeds maximum size")));
    }
    serde_json::from_slice(bytes).map_err(|e| invalid_argument(format!("invalid {what}: {e}")))
}

fn encode_json<T: Serialize>(value: &T, max: usize) -> Result<Vec<u8>, Status> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| Status::internal(format!("failed to serialize response JSON: {e}")))?;
    if bytes.len() > max {
        return Err(Status::resource_exhausted("serialized JSON exceeds size limit"));
    }
    Ok(bytes)
}

fn status_from_strata_error(err: StrataError) -> Status {
    match err {
        StrataError::Type(e) => Status::invalid_argument(e.to_string()),
        StrataError::InvalidQuery { .. } => Status::invalid_argument(err.to_string()),
        StrataError::Storage(StorageError::Connection(msg)) => Status::unavailable(msg),
        StrataError::Storage(e) => Status::internal(e.to_string()),
        StrataError::Analysis(e) => Status::aborted(e.to_string()),
        StrataError::Internal { message } => Status::internal(message),
    }
}

// ----------------------------------------------------------------------------
// Remote analysis capability
// ----------------------------------------------------------------------------

/// Adapts the analyzer client stream to the [`Analysis`] capability.
///
/// Each dispatch allocates a `call_id`, parks a oneshot in `pending`, and
/// pushes an `AnalyzeRequest` into the server-side stream; the inbound pump
/// resolves the oneshot when the matching `AnalyzerResult` arrives. A
/// closed client stream fails every outstanding and future dispatch, which
/// aborts whatever fixpoint is running.
struct RemoteAnalysis {
    name: String,
    requests: mpsc::Sender<Result<proto::AnalyzeRequest, Status>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Vec<Fact>, AnalysisError>>>>,
    next_call: AtomicU64,
    closed: AtomicBool,
}

impl RemoteAnalysis {
    fn new(name: String, requests: mpsc::Sender<Result<proto::AnalyzeRequest, Status>>) -> Self {
        Self {
            name,
            requests,
            pending: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Routes one client reply to the dispatch waiting on its call id.
    fn complete(&self, result: &proto::AnalyzerResult) {
        let sender = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&result.call_id),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            warn!(analyzer = %self.name, call_id = result.call_id, "reply for unknown call id");
            return;
        };

        let parsed = if result.facts_json.len() > MAX_REQUEST_JSON_BYTES {
            Err(AnalysisError::Remote {
                analyzer: self.name.clone(),
                message: "derived-facts payload exceeds maximum size".to_string(),
            })
        } else {
            serde_json::from_slice::<Vec<Fact>>(&result.facts_json).map_err(|e| {
                AnalysisError::Remote {
                    analyzer: self.name.clone(),
                    message: format!("invalid derived-facts JSON: {e}"),
                }
            })
        };
        let _ = sender.send(parsed);
    }

    /// Marks the client gone and fails every outstanding dispatch.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut pending) = self.pending.lock() {
            for (_, sender) in pending.drain() {
                let _ = sender.send(Err(AnalysisError::Disconnected {
                    analyzer: self.name.clone(),
                }));
            }
        }
    }

    fn disconnected(&self) -> AnalysisError {
        AnalysisError::Disconnected {
            analyzer: self.name.clone(),
        }
    }
}

#[async_trait]
impl Analysis for RemoteAnalysis {
    async fn analyze(&self, context: Context) -> Result<Vec<Fact>, AnalysisError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.disconnected());
        }

        let context_json = serde_json::to_vec(&context).map_err(|e| AnalysisError::Remote {
            analyzer: self.name.clone(),
            message: format!("failed to serialize context: {e}"),
        })?;

        let call_id = self.next_call.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| self.disconnected())?
            .insert(call_id, tx);

        let request = proto::AnalyzeRequest {
            call_id,
            context_json,
        };
        if self.requests.send(Ok(request)).await.is_err() {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&call_id);
            }
            return Err(self.disconnected());
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.disconnected()),
        }
    }
}

// ----------------------------------------------------------------------------
// Service
// ----------------------------------------------------------------------------

#[tonic::async_trait]
impl StrataService for StrataServiceImpl {
    async fn register_type(
        &self,
        request: Request<proto::RegisterTypeRequest>,
    ) -> Result<Response<proto::RegisterTypeReply>, Status> {
        let req = request.into_inner();
        let decl: TypeDecl = parse_json(&req.schema_json, "schema_json")?;

        let valid = self
            .engine
            .register_type(&decl.name, &decl.arg_types)
            .await
            .map_err(status_from_strata_error)?;
        Ok(Response::new(proto::RegisterTypeReply { valid }))
    }

    async fn set(
        &self,
        request: Request<proto::SetRequest>,
    ) -> Result<Response<proto::SetReply>, Status> {
        let req = request.into_inner();
        let facts: Vec<Fact> = parse_json(&req.facts_json, "facts_json")?;

        // Replies only once the triggered fixpoint has quiesced.
        self.engine
            .set(&facts)
            .await
            .map_err(status_from_strata_error)?;
        Ok(Response::new(proto::SetReply {}))
    }

    async fn derive(
        &self,
        request: Request<proto::DeriveRequest>,
    ) -> Result<Response<proto::DeriveReply>, Status> {
        let req = request.into_inner();
        let premises: Vec<FactTemplate> = parse_json(&req.query_json, "query_json")?;

        let contexts = self
            .engine
            .derive(&premises)
            .await
            .map_err(status_from_strata_error)?;
        let contexts_json = encode_json(&contexts, MAX_RESPONSE_JSON_BYTES)?;
        Ok(Response::new(proto::DeriveReply { contexts_json }))
    }

    type AnalyzerStream = ReceiverStream<Result<proto::AnalyzeRequest, Status>>;

    async fn analyzer(
        &self,
        request: Request<Streaming<proto::AnalyzerUp>>,
    ) -> Result<Response<Self::AnalyzerStream>, Status> {
        let mut inbound = request.into_inner();

        let first = inbound
            .message()
            .await?
            .ok_or_else(|| invalid_argument("analyzer stream closed before hello"))?;
        let Some(proto::analyzer_up::Msg::Hello(hello)) = first.msg else {
            return Err(invalid_argument("first analyzer message must be hello"));
        };
        if hello.name.is_empty() {
            return Err(invalid_argument("analyzer name is required"));
        }
        let premises: Vec<FactTemplate> = parse_json(&hello.premises_json, "premises_json")?;

        let (requests_tx, requests_rx) =
            mpsc::channel::<Result<proto::AnalyzeRequest, Status>>(ANALYZE_STREAM_CAPACITY);
        let remote = Arc::new(RemoteAnalysis::new(hello.name.clone(), requests_tx.clone()));

        // Pump client replies into the pending-call table until the client
        // hangs up.
        let pump = Arc::clone(&remote);
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(up)) => match up.msg {
                        Some(proto::analyzer_up::Msg::Result(result)) => pump.complete(&result),
                        Some(proto::analyzer_up::Msg::Hello(_)) => {
                            warn!(analyzer = %pump.name, "unexpected second hello, ignoring");
                        }
                        None => {}
                    },
                    Ok(None) => break,
                    Err(status) => {
                        debug!(analyzer = %pump.name, %status, "analyzer stream error");
                        break;
                    }
                }
            }
            pump.close();
        });

        // Registration (and the catch-up saturation it triggers) must run
        // after the reply stream is returned, or the first dispatches would
        // deadlock against a stream nobody is reading yet. Errors surface
        // in-band; the stream itself never completes on success.
        let engine = Arc::clone(&self.engine);
        let name = hello.name;
        tokio::spawn(async move {
            debug!(analyzer = %name, "registering analyzer");
            if let Err(err) = engine
                .add_analyzer(name.clone(), premises, remote as Arc<dyn Analysis>)
                .await
            {
                warn!(analyzer = %name, error = %err, "analyzer registration failed");
                let _ = requests_tx.send(Err(status_from_strata_error(err))).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(requests_rx)))
    }
}

pub use proto::strata_service_client::StrataServiceClient;

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fact::TemplateArg;
    use crate::storage::MemoryStore;
    use crate::value::Value;

    fn make_service() -> StrataServiceImpl {
        let engine = Arc::new(StrataEngine::new(Arc::new(MemoryStore::new())));
        StrataServiceImpl::new(engine)
    }

    fn register_req(name: &str, arg_types: Vec<ValueType>) -> proto::RegisterTypeRequest {
        let decl = TypeDecl {
            name: name.to_string(),
            arg_types,
        };
        proto::RegisterTypeRequest {
            schema_json: serde_json::to_vec(&decl).unwrap(),
        }
    }

    #[tokio::test]
    async fn register_type_reports_validity() {
        let svc = make_service();

        let resp = svc
            .register_type(Request::new(register_req("p", vec![ValueType::String])))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.valid);

        // Conflicting signature: valid=false, not an error.
        let resp = svc
            .register_type(Request::new(register_req("p", vec![ValueType::Addr])))
            .await
            .unwrap()
            .into_inner();
        assert!(!resp.valid);

        // Invalid name: valid=false.
        let resp = svc
            .register_type(Request::new(register_req("Bad-Name", vec![ValueType::Addr])))
            .await
            .unwrap()
            .into_inner();
        assert!(!resp.valid);
    }

    #[tokio::test]
    async fn set_then_derive_round_trips() {
        let svc = make_service();
        svc.register_type(Request::new(register_req("p", vec![ValueType::String])))
            .await
            .unwrap();

        let facts = vec![
            Fact::new("p", vec![Value::String("a".into())]),
            Fact::new("p", vec![Value::String("b".into())]),
        ];
        svc.set(Request::new(proto::SetRequest {
            facts_json: serde_json::to_vec(&facts).unwrap(),
        }))
        .await
        .unwrap();

        let query = vec![FactTemplate::new("p", vec![TemplateArg::Bound(0)])];
        let resp = svc
            .derive(Request::new(proto::DeriveRequest {
                query_json: serde_json::to_vec(&query).unwrap(),
            }))
            .await
            .unwrap()
            .into_inner();

        let contexts: Vec<Context> = serde_json::from_slice(&resp.contexts_json).unwrap();
        assert_eq!(
            contexts,
            vec![
                vec![Value::String("a".into())],
                vec![Value::String("b".into())],
            ]
        );
    }

    #[tokio::test]
    async fn ill_typed_set_maps_to_invalid_argument() {
        let svc = make_service();
        svc.register_type(Request::new(register_req("p", vec![ValueType::String])))
            .await
            .unwrap();

        let facts = vec![Fact::new("p", vec![Value::Addr(1)])];
        let status = svc
            .set(Request::new(proto::SetRequest {
                facts_json: serde_json::to_vec(&facts).unwrap(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn malformed_payloads_are_rejected() {
        let svc = make_service();

        let status = svc
            .register_type(Request::new(proto::RegisterTypeRequest {
                schema_json: Vec::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = svc
            .set(Request::new(proto::SetRequest {
                facts_json: b"not json".to_vec(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn error_status_mapping() {
        let err: StrataError = crate::error::TypeError::UnknownPredicate {
            predicate: "p".to_string(),
        }
        .into();
        assert_eq!(status_from_strata_error(err).code(), tonic::Code::InvalidArgument);

        let err: StrataError = StorageError::Connection("refused".to_string()).into();
        assert_eq!(status_from_strata_error(err).code(), tonic::Code::Unavailable);

        let err: StrataError = AnalysisError::Disconnected {
            analyzer: "a".to_string(),
        }
        .into();
        assert_eq!(status_from_strata_error(err).code(), tonic::Code::Aborted);
    }

    #[test]
    fn type_decl_serde_shape() {
        let decl = TypeDecl {
            name: "seg".to_string(),
            arg_types: vec![ValueType::String, ValueType::List(Box::new(ValueType::Addr))],
        };
        let json = serde_json::to_value(&decl).unwrap();
        assert_eq!(json["name"], "seg");
        assert_eq!(json["arg_types"][0]["type"], "string");
        assert_eq!(json["arg_types"][1]["type"], "list");
    }
}
