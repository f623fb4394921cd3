//! HTTP request logging middleware.
//!
//! One access-log line per request:
//! `IP "METHOD PATH HTTP/VERSION" STATUS SIZE "REFERRER" "USER_AGENT" DURATION`
//! plus OpenTelemetry request counters and histograms.

use std::{net::SocketAddr, sync::OnceLock, time::Instant};

use axum::{
    body::Body,
    http::{header, Request, Response},
    middleware::Next,
};
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;

struct HttpMetrics {
    request_count: Counter<u64>,
    request_duration: Histogram<f64>,
    response_size: Histogram<u64>,
}

static HTTP_METRICS: OnceLock<HttpMetrics> = OnceLock::new();

fn metrics() -> &'static HttpMetrics {
    HTTP_METRICS.get_or_init(|| {
        let meter = opentelemetry::global::meter("tilerender");
        HttpMetrics {
            request_count: meter
                .u64_counter("http.server.request.count")
                .with_description("Total HTTP requests")
                .with_unit("requests")
                .build(),
            request_duration: meter
                .f64_histogram("http.server.request.duration")
                .with_description("HTTP request duration")
                .with_unit("s")
                .build(),
            response_size: meter
                .u64_histogram("http.server.response.body.size")
                .with_description("HTTP response body size")
                .with_unit("By")
                .build(),
        }
    })
}

fn client_ip(request: &Request<Body>) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| {
            request
                .headers()
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .or_else(|| {
            request
                .extensions()
                .get::<axum::extract::ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| "-".to_string())
}

pub async fn request_logger(request: Request<Body>, next: Next) -> Response<Body> {
    let start = Instant::now();

    let method = request.method().to_string();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let version = format!("{:?}", request.version());
    let ip = client_ip(&request);
    let header_str = |name: header::HeaderName| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string()
    };
    let referrer = header_str(header::REFERER);
    let user_agent = header_str(header::USER_AGENT);

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16();
    let size = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    tracing::info!(
        target: "tilerender::http",
        "{ip} \"{method} {path} {version}\" {status} {size} \"{referrer}\" \"{user_agent}\" {duration:.6}"
    );

    let attrs = [
        KeyValue::new("http.request.method", method),
        KeyValue::new("http.response.status_code", i64::from(status)),
        KeyValue::new("url.path", path),
    ];
    let m = metrics();
    m.request_count.add(1, &attrs);
    m.request_duration.record(duration, &attrs);
    m.response_size.record(size, &attrs);

    response
}
