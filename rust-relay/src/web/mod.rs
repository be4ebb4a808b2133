//! HTTP surface of the relay.
//!
//! Every path goes to [`handlers::dispatch`], which routes on method. The
//! permissive CORS headers are attached to every response here, including
//! error responses.

pub mod handlers;
pub mod rate_limit;
pub mod signature;

use std::any::Any;

use axum::{
    http::{
        header::{
            ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
            ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE,
        },
        HeaderValue,
    },
    response::{IntoResponse, Response},
    Router,
};
use tower_http::{
    catch_panic::CatchPanicLayer, set_header::SetResponseHeaderLayer, trace::TraceLayer,
};

use crate::error::RelayError;

pub use handlers::{dispatch, AppState};
pub use rate_limit::{source_key, Clock, ManualClock, RateLimiter, SystemClock};
pub use signature::{is_auth_enabled, verify_ghost_signature, verify_request, verify_token};

/// Build the relay router.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Authorization"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static("86400"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A panicking handler becomes an opaque 500 with an error id.
fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    RelayError::Internal(anyhow::anyhow!("handler panicked: {}", detail)).into_response()
}
