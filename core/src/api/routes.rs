use bytes::Bytes;
use futures::stream::{self, StreamExt};
use http_body_util::{BodyExt, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;

use super::{detail_response, error_response, full_body, ok_json, ApiBody};
use crate::error::{CoreError, CoreResult};
use crate::events::SSE_RETRY_FRAME;
use crate::models::{
    FieldFilter, FlowFilter, FlowQuery, ReplayOpenRequest, ReplayResponse, RepeatRequest,
    ScopeSettings, SortKey, SortOrder, DEFAULT_QUERY_LIMIT, MAX_QUERY_LIMIT,
};
use crate::service::FlowService;

// Largest accepted request body (ingest carries bodies up to 2 MiB as base64).
const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MatchRequest {
    #[serde(rename = "where")]
    predicate: String,
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScopeUpdate {
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
    #[serde(default)]
    drop: bool,
}

/// Entry point for every request.
pub async fn handle(
    service: Arc<FlowService>,
    req: Request<Incoming>,
) -> Result<Response<ApiBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match route(&service, req).await {
        Ok(response) => response,
        Err(err) => error_response(&err),
    };
    tracing::debug!("{} {} -> {}", method, path, response.status().as_u16());
    Ok(response)
}

async fn route(service: &FlowService, req: Request<Incoming>) -> CoreResult<Response<ApiBody>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (&method, segments.as_slice()) {
        (&Method::POST, ["api", "ingest"]) => {
            let body = read_body(req).await?;
            service.ingest_json(&body).await?;
            Ok(ok_json(&json!({ "ok": true })))
        }
        (&Method::GET, ["api", "events"]) => Ok(event_stream(service)),

        (&Method::GET, ["api", "flows"]) => {
            let query = parse_flow_query(&query)?;
            Ok(ok_json(&service.list_flows(&query).await?))
        }
        (&Method::GET, ["api", "flows", "count"]) => {
            let query = parse_flow_query(&query)?;
            let count = service.count_flows(&query.filter).await?;
            Ok(ok_json(&json!({ "count": count })))
        }
        (&Method::POST, ["api", "flows", "match"]) => {
            let request: MatchRequest = read_json(req).await?;
            let matches = service.match_flows(&request.predicate, request.ids).await?;
            Ok(ok_json(&json!({ "matches": matches })))
        }
        (&Method::POST, ["api", "flows", "clear"]) => {
            service.clear_flows().await?;
            Ok(ok_json(&json!({ "ok": true })))
        }
        (&Method::GET, ["api", "flows", id]) => Ok(ok_json(&service.get_flow(id).await?)),
        (&Method::GET, ["api", "flows", id, "response", "body"]) => {
            Ok(ok_json(&service.get_response_body(id).await?))
        }

        (&Method::GET, ["api", "scope"]) => Ok(ok_json(&service.get_scope().await?)),
        (&Method::PUT, ["api", "scope"]) => {
            let update: ScopeUpdate = read_json(req).await?;
            let saved = service
                .set_scope(ScopeSettings::new(update.include, update.exclude, update.drop))
                .await?;
            Ok(ok_json(&saved))
        }
        (&Method::GET, ["api", "scope", "check"]) => {
            let params = query_params(&query);
            let url = params.get("url").ok_or_else(|| {
                CoreError::InvalidPayload("url query parameter is required".to_string())
            })?;
            Ok(ok_json(&service.check_scope(url)))
        }

        (&Method::POST, ["api", "repeat"]) => {
            let request: RepeatRequest = read_json(req).await?;
            Ok(ok_json(&service.repeat(request).await?))
        }
        (&Method::POST, ["api", "replay", "open"]) => {
            let request: ReplayOpenRequest = read_json(req).await?;
            Ok(ok_json(&service.open_replay(request)?))
        }
        (&Method::GET, ["api", "replay", token]) => Ok(ok_json(&service.replay_spec(token)?)),
        (&Method::GET, ["replay", token]) => {
            Ok(replay_response(service.execute_replay(token).await?))
        }

        _ => Ok(detail_response(StatusCode::NOT_FOUND, "Not Found")),
    }
}

async fn read_body(req: Request<Incoming>) -> CoreResult<Bytes> {
    let collected = Limited::new(req.into_body(), MAX_REQUEST_BYTES)
        .collect()
        .await
        .map_err(|e| CoreError::InvalidPayload(format!("failed to read request body: {}", e)))?;
    Ok(collected.to_bytes())
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> CoreResult<T> {
    let body = read_body(req).await?;
    serde_json::from_slice(&body).map_err(|e| CoreError::InvalidPayload(e.to_string()))
}

fn query_params(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

fn text_param(params: &HashMap<String, String>, name: &str) -> Option<String> {
    params
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn number_param<T>(params: &HashMap<String, String>, name: &str) -> CoreResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match text_param(params, name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| CoreError::InvalidPayload(format!("invalid {}: {}", name, e))),
        None => Ok(None),
    }
}

/// Listing parameters: paging, sort, a `where` predicate and the older
/// structured field filters.
pub(crate) fn parse_flow_query(query: &str) -> CoreResult<FlowQuery> {
    let params = query_params(query);

    let limit = number_param::<u32>(&params, "limit")?.unwrap_or(DEFAULT_QUERY_LIMIT);
    if !(1..=MAX_QUERY_LIMIT).contains(&limit) {
        return Err(CoreError::InvalidPayload(format!(
            "limit must be between 1 and {}",
            MAX_QUERY_LIMIT
        )));
    }
    let offset = number_param::<u64>(&params, "offset")?.unwrap_or(0);

    let sort = match text_param(&params, "sort") {
        Some(raw) => SortKey::from_wire(&raw)
            .ok_or_else(|| CoreError::InvalidPayload(format!("unknown sort key {:?}", raw)))?,
        None => SortKey::default(),
    };
    let order = match text_param(&params, "order") {
        Some(raw) => SortOrder::from_wire(&raw.to_ascii_lowercase())
            .ok_or_else(|| CoreError::InvalidPayload(format!("unknown sort order {:?}", raw)))?,
        None => SortOrder::default(),
    };

    let fields = FieldFilter {
        q: text_param(&params, "q"),
        host: text_param(&params, "host"),
        method: text_param(&params, "method"),
        status: number_param(&params, "status")?,
        url_contains: text_param(&params, "url_contains"),
        body_contains: text_param(&params, "body_contains"),
        duration_min: number_param(&params, "duration_min")?,
        duration_max: number_param(&params, "duration_max")?,
        resp_size_min: number_param(&params, "resp_size_min")?,
        resp_size_max: number_param(&params, "resp_size_max")?,
    };

    Ok(FlowQuery {
        limit,
        offset,
        filter: FlowFilter {
            predicate: text_param(&params, "where"),
            fields,
        },
        sort,
        order,
    })
}

fn event_stream(service: &FlowService) -> Response<ApiBody> {
    let subscription = service.bus().subscribe();

    let retry = stream::once(async {
        Ok::<_, Infallible>(Frame::data(Bytes::from_static(SSE_RETRY_FRAME.as_bytes())))
    });
    let events = stream::unfold(subscription, |mut subscription| async move {
        let message = subscription.next().await?;
        let frame = Frame::data(Bytes::from(message.to_sse_frame()));
        Some((Ok::<_, Infallible>(frame), subscription))
    });

    let mut response = Response::new(StreamBody::new(retry.chain(events)).boxed_unsync());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn replay_response(upstream: ReplayResponse) -> Response<ApiBody> {
    let ReplayResponse {
        status,
        headers,
        body,
    } = upstream;

    let mut response = Response::new(full_body(body));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => tracing::debug!("Skipping unrepresentable upstream header {:?}", name),
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_query_defaults() {
        let query = parse_flow_query("").unwrap();
        assert_eq!(query, FlowQuery::default());
    }

    #[test]
    fn flow_query_reads_predicate_and_fields() {
        let query = parse_flow_query(
            "limit=50&offset=10&where=status%20%3E%3D%20400&sort=time&order=asc\
             &host=api.example.com&status=404&duration_min=0.5&resp_size_max=1024&q=",
        )
        .unwrap();
        assert_eq!(query.limit, 50);
        assert_eq!(query.offset, 10);
        assert_eq!(query.filter.predicate.as_deref(), Some("status >= 400"));
        assert_eq!(query.sort, SortKey::Duration);
        assert_eq!(query.order, SortOrder::Asc);
        assert_eq!(query.filter.fields.host.as_deref(), Some("api.example.com"));
        assert_eq!(query.filter.fields.status, Some(404));
        assert_eq!(query.filter.fields.duration_min, Some(0.5));
        assert_eq!(query.filter.fields.resp_size_max, Some(1024));
        assert_eq!(query.filter.fields.q, None);
    }

    #[test]
    fn flow_query_rejects_bad_values() {
        for bad in ["limit=0", "limit=2001", "offset=-1", "sort=bogus", "order=up", "status=abc"] {
            assert!(
                matches!(parse_flow_query(bad), Err(CoreError::InvalidPayload(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn request_bodies_are_strict() {
        assert!(serde_json::from_str::<MatchRequest>(r#"{"where":"1","ids":["a"]}"#).is_ok());
        assert!(serde_json::from_str::<MatchRequest>(r#"{"where":"1","extra":0}"#).is_err());
        let update: ScopeUpdate = serde_json::from_str(r#"{"include":["a"]}"#).unwrap();
        assert!(update.exclude.is_empty());
        assert!(!update.drop);
    }

    #[test]
    fn replay_response_copies_headers() {
        let response = replay_response(ReplayResponse {
            status: 302,
            headers: vec![
                ("Location".into(), "https://h/next".into()),
                ("Set-Cookie".into(), "a=1".into()),
                ("Set-Cookie".into(), "b=2".into()),
                ("bad name".into(), "x".into()),
            ],
            body: Vec::new(),
        });
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get_all("set-cookie").iter().count(), 2);
        assert_eq!(response.headers()["location"], "https://h/next");
    }
}
