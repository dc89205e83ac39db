//! JSON API and the two pull/push streaming transports.
//!
//! | Route                                          | Operation                 |
//! |------------------------------------------------|---------------------------|
//! | `GET /api/scripts`                             | list scripts              |
//! | `POST /api/scripts/:repoName/:scriptName/start`| start a run               |
//! | `GET /api/pty`                                 | list sessions             |
//! | `POST /api/pty/:pid/stop`                      | stop a run                |
//! | `GET /api/pty/:pid/buffer`                     | replay buffer snapshot    |
//! | `DELETE /api/pty/:pid`                         | destroy a session         |
//! | `GET /api/pty/:pid/stream`                     | SSE or chunked output     |

use axum::{
    body::Body,
    extract::{FromRequest, Path, Query, Request, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Form, Json, Router,
};
use futures_util::StreamExt;
use runboard_core::{
    Framing, RunboardError, ScriptEntry, ScriptIdentity, SessionId, SessionRegistry,
    SessionSummary, StopOutcome, StreamFrame, StreamOptions, FINISHED_MARKER,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
}

pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/api/scripts", get(list_scripts))
        .route(
            "/api/scripts/:repo_name/:script_name/start",
            post(start_script),
        )
        .route("/api/pty", get(list_sessions))
        .route("/api/pty/:pid", delete(destroy_session))
        .route("/api/pty/:pid/stop", post(stop_session))
        .route("/api/pty/:pid/buffer", get(buffer_snapshot))
        .route("/api/pty/:pid/stream", get(stream_output))
        .with_state(AppState { registry })
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

type ApiResult<T> = Result<T, ApiError>;

impl From<RunboardError> for ApiError {
    fn from(err: RunboardError) -> Self {
        let status = if err.is_not_found() {
            StatusCode::NOT_FOUND
        } else {
            error!(error = %err, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn list_scripts(State(state): State<AppState>) -> ApiResult<Json<Vec<ScriptEntry>>> {
    Ok(Json(state.registry.catalog().list()?))
}

/// `arg` may be a single value or a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ArgValue {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Default, Deserialize)]
struct StartBody {
    arg: Option<ArgValue>,
    #[serde(default)]
    env: HashMap<String, String>,
}

impl StartBody {
    fn from_pairs(pairs: &[(String, String)]) -> Self {
        let args = arg_pairs(pairs);
        Self {
            arg: (!args.is_empty()).then_some(ArgValue::Many(args)),
            env: HashMap::new(),
        }
    }
}

/// `arg=` and `arg[]=` values, in order.
fn arg_pairs(pairs: &[(String, String)]) -> Vec<String> {
    pairs
        .iter()
        .filter(|(key, _)| key == "arg" || key == "arg[]")
        .map(|(_, value)| value.clone())
        .collect()
}

/// Arguments come from the body (JSON or form); the query string is only
/// consulted when the body has none.
fn start_args(body: Option<&StartBody>, query: &[(String, String)]) -> Vec<String> {
    let from_body = match body.and_then(|b| b.arg.as_ref()) {
        Some(ArgValue::One(arg)) => vec![arg.clone()],
        Some(ArgValue::Many(args)) => args.clone(),
        None => Vec::new(),
    };
    if !from_body.is_empty() {
        return from_body;
    }
    arg_pairs(query)
}

/// Read a start body as JSON or as a urlencoded form. A missing or
/// unreadable body counts as empty.
async fn read_start_body(request: Request) -> StartBody {
    let is_form = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

    if is_form {
        match Form::<Vec<(String, String)>>::from_request(request, &()).await {
            Ok(Form(pairs)) => StartBody::from_pairs(&pairs),
            Err(e) => {
                debug!(error = %e, "ignoring unreadable form body");
                StartBody::default()
            }
        }
    } else {
        match Json::<StartBody>::from_request(request, &()).await {
            Ok(Json(body)) => body,
            Err(e) => {
                debug!(error = %e, "no usable JSON body");
                StartBody::default()
            }
        }
    }
}

async fn start_script(
    State(state): State<AppState>,
    Path((repo_name, script_name)): Path<(String, String)>,
    Query(query): Query<Vec<(String, String)>>,
    request: Request,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let body = read_start_body(request).await;
    let args = start_args(Some(&body), &query);
    let identity = ScriptIdentity::new(repo_name, script_name);

    let session = state
        .registry
        .start(identity.clone(), args, body.env)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "pid": session.id(),
            "repoName": identity.group,
            "scriptName": identity.name,
            "args": session.args(),
            "message": "script started",
            "logFile": session.log_file_name(),
        })),
    ))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.registry.list().await)
}

async fn stop_session(
    State(state): State<AppState>,
    Path(pid): Path<SessionId>,
) -> ApiResult<Json<Value>> {
    let message = match state.registry.terminate(pid).await? {
        StopOutcome::Signalled => format!("process {pid} terminated"),
        StopOutcome::AlreadyFinished => format!("process {pid} already finished"),
    };
    Ok(Json(json!({ "message": message })))
}

async fn buffer_snapshot(
    State(state): State<AppState>,
    Path(pid): Path<SessionId>,
) -> ApiResult<Json<runboard_core::BufferSnapshot>> {
    Ok(Json(state.registry.snapshot(pid).await?))
}

async fn destroy_session(
    State(state): State<AppState>,
    Path(pid): Path<SessionId>,
) -> ApiResult<Json<Value>> {
    state.registry.destroy(pid).await?;
    Ok(Json(json!({ "message": format!("process {pid} destroyed") })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamQuery {
    include_history: Option<String>,
    sse: Option<String>,
}

impl StreamQuery {
    fn options(&self) -> StreamOptions {
        let include_history = !matches!(self.include_history.as_deref(), Some("false" | "0"));
        let framing = if self.sse.as_deref() == Some("true") {
            Framing::Lines
        } else {
            Framing::Chunked
        };
        StreamOptions {
            include_history,
            framing,
        }
    }
}

async fn stream_output(
    State(state): State<AppState>,
    Path(pid): Path<SessionId>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Response> {
    let options = query.options();
    let stream = state.registry.attach_stream(pid, options).await?;
    debug!(session_id = pid, ?options, "stream client attached");

    let response = match options.framing {
        Framing::Lines => {
            let finished_at_attach = stream.finished_at_attach();
            let events = stream
                .into_stream()
                .flat_map(move |frame| {
                    futures_util::stream::iter(sse_events(frame, finished_at_attach))
                })
                .map(Ok::<_, Infallible>);
            (
                [
                    (header::CACHE_CONTROL, "no-cache"),
                    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                ],
                Sse::new(events),
            )
                .into_response()
        }
        Framing::Chunked => {
            let body = Body::from_stream(
                stream
                    .into_stream()
                    .map(|frame| Ok::<_, Infallible>(chunk_bytes(frame))),
            );
            (
                [
                    (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
                    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                ],
                body,
            )
                .into_response()
        }
    };
    Ok(response)
}

/// SSE events for one frame. `Event::data` rejects `\r`, so raw chunks
/// are scrubbed. A session that had already finished when the client
/// attached gets a `[process finished]` line before `close`.
fn sse_events(frame: StreamFrame, finished_at_attach: bool) -> Vec<Event> {
    match frame {
        StreamFrame::Line(line) => vec![Event::default().data(line)],
        StreamFrame::Chunk(chunk) => vec![Event::default()
            .data(String::from_utf8_lossy(&chunk).replace(['\r', '\n'], ""))],
        StreamFrame::End => {
            let close = Event::default().event("close").data("Process finished");
            if finished_at_attach {
                vec![Event::default().data("[process finished]"), close]
            } else {
                vec![close]
            }
        }
    }
}

fn chunk_bytes(frame: StreamFrame) -> Vec<u8> {
    match frame {
        StreamFrame::Chunk(chunk) => chunk,
        StreamFrame::Line(mut line) => {
            line.push('\n');
            line.into_bytes()
        }
        StreamFrame::End => FINISHED_MARKER.as_bytes().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fixtures::fixture;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    async fn send(app: Router, request: HttpRequest<Body>) -> (StatusCode, HeaderMapText, String) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    type HeaderMapText = Vec<(String, String)>;

    fn header_value<'a>(headers: &'a HeaderMapText, name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn get(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, content_type: &str, body: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    /// Position of each needle in `haystack`, asserting they appear in order.
    fn assert_in_order(haystack: &str, needles: &[&str]) {
        let mut from = 0;
        for needle in needles {
            let at = haystack[from..]
                .find(needle)
                .unwrap_or_else(|| panic!("{needle:?} missing after byte {from} in {haystack:?}"));
            from += at + needle.len();
        }
    }

    #[tokio::test]
    async fn sse_live_output_is_line_framed() {
        let f = fixture();
        let pid = f.start_build().await;
        let app = router(f.registry.clone());

        let spawner = f.spawner.clone();
        let producer = async move {
            // Give the request time to attach before output flows.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            spawner.emit(pid, b"step 1\r\nstep");
            spawner.emit(pid, b" 2\r\n\r\ntail\r");
            spawner.exit(pid, 0);
        };
        let request = get(&format!("/api/pty/{pid}/stream?sse=true"));
        let ((status, headers, body), ()) = tokio::join!(send(app, request), producer);

        assert_eq!(status, StatusCode::OK);
        assert!(header_value(&headers, "content-type")
            .is_some_and(|ct| ct.starts_with("text/event-stream")));
        assert_eq!(header_value(&headers, "cache-control"), Some("no-cache"));
        assert!(!body.contains('\r'), "{body:?}");
        assert_in_order(
            &body,
            &[
                "data: step 1\n\n",
                "data: step 2\n\n",
                "data: tail\n\n",
                "event: close\ndata: Process finished\n\n",
            ],
        );
        assert!(!body.contains("[process finished]"));
    }

    #[tokio::test]
    async fn sse_on_finished_run_replays_then_closes() {
        let f = fixture();
        let pid = f.finished_run(b"built\r\nok").await;
        let (status, _, body) = send(
            router(f.registry.clone()),
            get(&format!("/api/pty/{pid}/stream?sse=true")),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_in_order(
            &body,
            &[
                "data: built\n\n",
                "data: ok\n\n",
                "data: [process finished]\n\n",
                "event: close\ndata: Process finished\n\n",
            ],
        );
    }

    #[tokio::test]
    async fn chunked_stream_ends_with_marker() {
        let f = fixture();
        let pid = f.finished_run(b"raw\r\nbytes").await;
        let (status, headers, body) = send(
            router(f.registry.clone()),
            get(&format!("/api/pty/{pid}/stream")),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(header_value(&headers, "content-type").is_some_and(|ct| ct.starts_with("text/plain")));
        assert_eq!(body, format!("raw\r\nbytes{FINISHED_MARKER}"));
    }

    #[tokio::test]
    async fn unknown_session_is_404_json() {
        let f = fixture();
        let (status, _, body) = send(router(f.registry.clone()), get("/api/pty/424242/buffer")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let json: Value = serde_json::from_str(&body).unwrap();
        assert!(json["error"].as_str().is_some_and(|e| e.contains("424242")));
    }

    #[tokio::test]
    async fn start_accepts_form_json_and_query_args() {
        let f = fixture();
        let uri = "/api/scripts/project-a/build/start";

        let (status, _, body) = send(
            router(f.registry.clone()),
            post(uri, "application/x-www-form-urlencoded", "arg=a&arg%5B%5D=b"),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["args"], json!(["a", "b"]));
        assert_eq!(json["repoName"], "project-a");

        let (status, _, _) = send(
            router(f.registry.clone()),
            post(uri, "application/json", r#"{"arg": "solo"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _, _) = send(
            router(f.registry.clone()),
            HttpRequest::builder()
                .method("POST")
                .uri(format!("{uri}?arg=q1&arg=q2"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let args: Vec<Vec<String>> = f
            .spawner
            .requests()
            .into_iter()
            .map(|r| r.args[1..].to_vec())
            .collect();
        assert_eq!(args, vec![vec!["a", "b"], vec!["solo"], vec!["q1", "q2"]]);
    }

    #[test]
    fn sse_events_never_carry_carriage_returns() {
        // Event::data panics on '\r'; raw chunks must be scrubbed first.
        let events = sse_events(StreamFrame::Chunk(b"a\r\nb\r".to_vec()), false);
        assert_eq!(events.len(), 1);
        assert_eq!(sse_events(StreamFrame::End, false).len(), 1);
        assert_eq!(sse_events(StreamFrame::End, true).len(), 2);
    }

    #[test]
    fn form_pairs_become_args() {
        let body = StartBody::from_pairs(&pairs(&[("arg", "x"), ("env", "y"), ("arg[]", "z")]));
        assert_eq!(start_args(Some(&body), &[]), vec!["x", "z"]);
        assert!(StartBody::from_pairs(&[]).arg.is_none());
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn args_from_body_win() {
        let body: StartBody = serde_json::from_str(r#"{"arg": ["a", "b"]}"#).unwrap();
        let query = pairs(&[("arg", "ignored")]);
        assert_eq!(start_args(Some(&body), &query), vec!["a", "b"]);

        let body: StartBody = serde_json::from_str(r#"{"arg": "solo"}"#).unwrap();
        assert_eq!(start_args(Some(&body), &[]), vec!["solo"]);
    }

    #[test]
    fn args_fall_back_to_query() {
        let query = pairs(&[("arg", "one"), ("other", "x"), ("arg[]", "two")]);
        assert_eq!(start_args(None, &query), vec!["one", "two"]);
        assert_eq!(start_args(Some(&StartBody::default()), &query), vec!["one", "two"]);
    }

    #[test]
    fn stream_query_defaults() {
        let options = StreamQuery::default().options();
        assert!(options.include_history);
        assert_eq!(options.framing, Framing::Chunked);

        for off in ["false", "0"] {
            let q = StreamQuery {
                include_history: Some(off.into()),
                sse: Some("true".into()),
            };
            let options = q.options();
            assert!(!options.include_history);
            assert_eq!(options.framing, Framing::Lines);
        }
    }

    #[test]
    fn chunked_end_marker() {
        assert_eq!(chunk_bytes(StreamFrame::End), FINISHED_MARKER.as_bytes());
        assert_eq!(chunk_bytes(StreamFrame::Chunk(b"raw\r".to_vec())), b"raw\r");
    }

    #[test]
    fn not_found_errors_map_to_404() {
        let err = ApiError::from(RunboardError::SessionNotFound(4));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err = ApiError::from(RunboardError::Spawn("boom".into()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
