//! OpenTelemetry server spans for every call.
//!
//! [`TraceLayer`] extracts the caller's trace context from the request
//! headers with the globally installed propagator, opens a `Server` span
//! named after the gRPC method, and inserts the span's
//! [`opentelemetry::Context`] into the request extensions so handlers can
//! create child spans. The span records the `grpc-status` code when it is
//! available on the response headers (trailers-only responses, which include
//! every rejection produced by the admission layer).

use core::task::{Context, Poll};
use futures::future::BoxFuture;
use opentelemetry::{
    Context as TraceContext, KeyValue,
    global::{self, BoxedTracer},
    propagation::Extractor,
    trace::{SpanKind, Status as SpanStatus, TraceContextExt, Tracer},
};
use std::sync::Arc;
use tower::{Layer, Service};
use turnstile_core::BoxError;

const GRPC_STATUS_HEADER: &str = "grpc-status";

/// Handle to the tracer used for server spans.
#[derive(Clone)]
pub struct TraceClient {
    tracer: Arc<BoxedTracer>,
}

impl TraceClient {
    /// Uses a tracer named `name` from the global tracer provider.
    pub fn new(name: &'static str) -> Self {
        Self::from_tracer(global::tracer(name))
    }

    pub fn from_tracer(tracer: BoxedTracer) -> Self {
        Self {
            tracer: Arc::new(tracer),
        }
    }

    /// Builds the tracing middleware for this tracer.
    pub fn layer(&self) -> TraceLayer {
        TraceLayer::new(self.clone())
    }
}

impl core::fmt::Debug for TraceClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TraceClient").finish_non_exhaustive()
    }
}

/// Layer opening one server span per call.
#[derive(Clone, Debug)]
pub struct TraceLayer {
    client: TraceClient,
}

impl TraceLayer {
    pub fn new(client: TraceClient) -> Self {
        Self { client }
    }
}

impl<S> Layer<S> for TraceLayer {
    type Service = Traced<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Traced {
            inner,
            tracer: Arc::clone(&self.client.tracer),
        }
    }
}

/// Service produced by [`TraceLayer`].
#[derive(Clone)]
pub struct Traced<S> {
    inner: S,
    tracer: Arc<BoxedTracer>,
}

impl<S, B, ResBody> Service<http::Request<B>> for Traced<S>
where
    S: Service<http::Request<B>, Response = http::Response<ResBody>> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = http::Response<ResBody>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, mut req: http::Request<B>) -> Self::Future {
        let method = req.uri().path().to_owned();
        let parent = global::get_text_map_propagator(|propagator| {
            propagator.extract(&HeaderExtractor(req.headers()))
        });

        let span = self
            .tracer
            .span_builder(method.clone())
            .with_kind(SpanKind::Server)
            .with_attributes([
                KeyValue::new("rpc.system", "grpc"),
                KeyValue::new("rpc.method", method),
            ])
            .start_with_context(self.tracer.as_ref(), &parent);
        let trace_cx = parent.with_span(span);
        req.extensions_mut().insert(trace_cx.clone());

        // Call the instance that was driven to readiness and keep a fresh
        // clone for the next call.
        let clone = self.inner.clone();
        let mut inner = core::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let result = inner.call(req).await.map_err(Into::into);
            record_outcome(&trace_cx, &result);
            result
        })
    }
}

fn record_outcome<ResBody>(
    trace_cx: &TraceContext,
    result: &Result<http::Response<ResBody>, BoxError>,
) {
    let span = trace_cx.span();
    match result {
        Ok(resp) => {
            if let Some(code) = grpc_status(resp.headers()) {
                span.set_attribute(KeyValue::new("rpc.grpc.status_code", i64::from(code)));
                if code != 0 {
                    span.set_status(SpanStatus::error(format!("grpc-status {code}")));
                }
            }
        }
        Err(e) => span.set_status(SpanStatus::error(e.to_string())),
    }
    span.end();
}

fn grpc_status(headers: &http::HeaderMap) -> Option<i32> {
    headers.get(GRPC_STATUS_HEADER)?.to_str().ok()?.parse().ok()
}

struct HeaderExtractor<'a>(&'a http::HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(http::HeaderName::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::TraceId;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use tonic::{Code, Status};
    use tower::{ServiceExt, service_fn};

    #[test]
    fn reads_grpc_status_from_headers() {
        let resp: http::Response<String> = Status::resource_exhausted("busy").into_http();
        assert_eq!(grpc_status(resp.headers()), Some(Code::ResourceExhausted as i32));
        assert_eq!(grpc_status(&http::HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn handler_receives_the_callers_trace() {
        global::set_text_map_propagator(TraceContextPropagator::new());

        let handler = service_fn(|req: http::Request<String>| async move {
            let trace_cx = req
                .extensions()
                .get::<TraceContext>()
                .cloned()
                .expect("trace context in extensions");
            let trace_id = trace_cx.span().span_context().trace_id();
            Ok::<_, BoxError>(http::Response::new(trace_id.to_string()))
        });
        let service = TraceClient::new("turnstile-test").layer().layer(handler);

        let req = http::Request::builder()
            .uri("/test.Echo/Say")
            .header(
                "traceparent",
                "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
            )
            .body(String::new())
            .unwrap();
        let resp = service.oneshot(req).await.unwrap();

        assert_eq!(
            resp.into_body(),
            TraceId::from_hex("0af7651916cd43dd8448eb211c80319c")
                .unwrap()
                .to_string()
        );
    }
}
