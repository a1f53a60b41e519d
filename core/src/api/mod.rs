//! HTTP surface
//!
//! A thin hyper 1.x front over [`FlowService`](crate::service::FlowService):
//! JSON in, JSON out, one server-sent-events stream for live flows and the
//! raw replay execution path. Errors are rendered as `{"detail": "..."}` with
//! the status from [`CoreError::status_code`].

mod routes;
mod server;

pub use routes::handle;
pub use server::{run_server, serve};

use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::convert::Infallible;

use crate::error::CoreError;

pub type ApiBody = UnsyncBoxBody<Bytes, Infallible>;

pub(crate) fn full_body(data: impl Into<Bytes>) -> ApiBody {
    Full::new(data.into()).boxed_unsync()
}

pub(crate) fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ApiBody> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(full_body(body));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            tracing::error!("Failed to encode response: {}", e);
            detail_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode response")
        }
    }
}

pub(crate) fn ok_json<T: Serialize>(value: &T) -> Response<ApiBody> {
    json_response(StatusCode::OK, value)
}

pub(crate) fn detail_response(status: StatusCode, detail: &str) -> Response<ApiBody> {
    let body = serde_json::json!({ "detail": detail }).to_string();
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub(crate) fn error_response(err: &CoreError) -> Response<ApiBody> {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if err.is_client_error() {
        tracing::debug!("Request rejected: {}", err);
    } else {
        tracing::error!("Request failed: {}", err);
    }
    detail_response(status, &err.to_string())
}
