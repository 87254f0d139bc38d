//! HTTP bridge: POST /chat runs turns, GET/POST /approvals inspects and
//! resolves pending approvals. Several worker threads share the listener so
//! a turn suspended on an approval never blocks the resolve request that
//! would release it.

use std::io;
use std::sync::Arc;
use std::thread;

use tiny_http::{Method, Response, Server};

use crate::{
    build_runtime, run_turn, try_handle_approval_chat, AgentRuntime, ConsoleChannel, GateError,
    HttpBackend, TurnPolicy,
};

pub(crate) fn run_http_bridge(
    bind: &str,
    port: u16,
    workers: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Arc::new(build_runtime(Box::new(ConsoleChannel))?);
    let backend = Arc::new(HttpBackend::from_env(
        &runtime.cfg.backend_url,
        &runtime.cfg.model,
    )?);

    let addr = format!("{bind}:{port}");
    let server = Server::http(&addr)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("server: {e}")))?;
    let server = Arc::new(server);
    eprintln!("lodestar listening on http://{addr}");

    let mut handles = Vec::new();
    for _ in 0..workers.max(1) {
        let server = Arc::clone(&server);
        let runtime = Arc::clone(&runtime);
        let backend = Arc::clone(&backend);
        handles.push(thread::spawn(move || {
            for request in server.incoming_requests() {
                handle_request(&runtime, &backend, request);
            }
        }));
    }
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

fn handle_request(runtime: &AgentRuntime, backend: &HttpBackend, mut request: tiny_http::Request) {
    let method = request.method().clone();
    let url = request.url().to_string();
    let path = url.split('?').next().unwrap_or("");

    let response = match (method, path) {
        (Method::Get, "/health") => json_response(200, &serde_json::json!({ "ok": true })),
        (Method::Get, "/approvals") => json_response(
            200,
            &serde_json::json!({ "pending": runtime.gate.pending_summaries() }),
        ),
        (Method::Post, "/approvals") => {
            match parse_json_body(&mut request).and_then(|p| parse_approval_payload(&p)) {
                Ok((token, approve)) => match runtime.gate.resolve(&token, approve) {
                    Ok(()) => json_response(200, &serde_json::json!({ "resolved": true })),
                    Err(GateError::UnknownToken(_)) => json_response(
                        410,
                        &serde_json::json!({
                            "error": "approval already resolved or expired"
                        }),
                    ),
                },
                Err(err) => json_response(400, &serde_json::json!({ "error": err })),
            }
        }
        (Method::Post, "/chat") => {
            match parse_json_body(&mut request).and_then(|p| parse_chat_payload(&p)) {
                Ok((session, message, policy)) => {
                    // Chat-level approve/reject works here too.
                    if let Some(reply) = try_handle_approval_chat(&runtime.gate, &message) {
                        json_response(
                            200,
                            &serde_json::json!({ "session": session, "final_text": reply }),
                        )
                    } else {
                        match run_turn(
                            &runtime.store,
                            &runtime.registry,
                            &runtime.gate,
                            backend,
                            &session,
                            &message,
                            &policy,
                            &runtime.cfg,
                        ) {
                            Ok(output) => match serde_json::to_value(&output) {
                                Ok(body) => json_response(200, &body),
                                Err(err) => json_response(
                                    500,
                                    &serde_json::json!({ "error": err.to_string() }),
                                ),
                            },
                            Err(err) => {
                                json_response(502, &serde_json::json!({ "error": err.to_string() }))
                            }
                        }
                    }
                }
                Err(err) => json_response(400, &serde_json::json!({ "error": err })),
            }
        }
        _ => json_response(404, &serde_json::json!({ "error": "not found" })),
    };
    let _ = request.respond(response);
}

pub(crate) fn parse_json_body(request: &mut tiny_http::Request) -> Result<serde_json::Value, String> {
    let mut body = String::new();
    request
        .as_reader()
        .read_to_string(&mut body)
        .map_err(|e| format!("read body: {e}"))?;
    if body.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(&body).map_err(|e| format!("json: {e}"))
}

pub(crate) fn parse_chat_payload(
    payload: &serde_json::Value,
) -> Result<(String, String, TurnPolicy), String> {
    let message = payload
        .get("message")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing 'message'".to_string())?;
    let session = payload
        .get("session")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("http")
        .to_string();
    let policy = TurnPolicy {
        require_tool: payload
            .get("require_tool")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        allowed_tools: payload.get("tools").and_then(|v| v.as_array()).map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        }),
    };
    Ok((session, message.to_string(), policy))
}

pub(crate) fn parse_approval_payload(payload: &serde_json::Value) -> Result<(String, bool), String> {
    let token = payload
        .get("token")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing 'token'".to_string())?;
    let approve = payload
        .get("approve")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| "missing 'approve' boolean".to_string())?;
    Ok((token.to_string(), approve))
}

fn json_response(status: u16, body: &serde_json::Value) -> Response<io::Cursor<Vec<u8>>> {
    let mut response = Response::from_string(body.to_string()).with_status_code(status);
    if let Ok(header) =
        tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
    {
        response = response.with_header(header);
    }
    response
}
