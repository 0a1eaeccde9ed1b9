use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type Handler = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const HANDLERS: &[Handler] = &[
    handlers::core::try_handle,
    handlers::users::try_handle,
    handlers::students::try_handle,
    handlers::attendance::try_handle,
    handlers::requests::try_handle,
    handlers::delivery::try_handle,
    handlers::dashboard::try_handle,
    handlers::notices::try_handle,
    handlers::sync::try_handle,
    handlers::admin::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    let resp = HANDLERS
        .iter()
        .find_map(|h| h(state, &req))
        .unwrap_or_else(|| {
            err(
                &req.id,
                "not_implemented",
                format!("unknown method: {}", req.method),
                None,
            )
        });

    if resp.get("ok").and_then(|v| v.as_bool()) == Some(true) {
        tracing::debug!(id = %req.id, method = %req.method, "request ok");
    } else {
        let code = resp
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        tracing::warn!(id = %req.id, method = %req.method, code, "request failed");
    }
    resp
}
