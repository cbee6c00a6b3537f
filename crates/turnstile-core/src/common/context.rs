//! Per-call context handed unmodified to the handler of a [`Job`].
//!
//! [`Job`]: crate::Job

use core::time::Duration;
use http::HeaderMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Header carrying the client's deadline as `<digits><unit>`.
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// gRPC caps the timeout value at eight digits.
const MAX_TIMEOUT_DIGITS: usize = 8;

/// Call-scoped state shared between the admission path and the worker that
/// executes the call.
///
/// Cloning is cheap: every clone observes the same deadline and the same
/// cancellation token. The token is cancelled when the caller stops waiting
/// for the result (for example when the client disconnects), which lets a
/// running job observe that nobody will read its response.
#[derive(Clone, Debug)]
pub struct CallContext {
    method: Arc<str>,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl CallContext {
    /// Creates a context for `method` without a deadline.
    pub fn new(method: impl Into<Arc<str>>) -> Self {
        Self {
            method: method.into(),
            deadline: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Creates a context for `method`, taking the deadline from the
    /// `grpc-timeout` header if one is present and well formed.
    pub fn from_headers(method: impl Into<Arc<str>>, headers: &HeaderMap) -> Self {
        let deadline = headers
            .get(GRPC_TIMEOUT_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_grpc_timeout)
            .map(|timeout| Instant::now() + timeout);

        Self {
            deadline,
            ..Self::new(method)
        }
    }

    /// Returns a copy of this context with an explicit deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Full method path of the call, e.g. `/grpc.health.v1.Health/Check`.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `Some(Duration::ZERO)` once it passed.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the caller has given up on the call.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation.cancelled()
    }
}

/// Parses a `grpc-timeout` header value such as `"250m"` or `"1S"`.
///
/// Returns `None` for malformed values, which callers treat as "no deadline".
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    let split = value.len().checked_sub(1)?;
    if !value.is_char_boundary(split) {
        return None;
    }
    let (digits, unit) = value.split_at(split);
    if digits.is_empty()
        || digits.len() > MAX_TIMEOUT_DIGITS
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;

    let timeout = match unit {
        "H" => Duration::from_secs(amount * 60 * 60),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn parses_every_timeout_unit() {
        assert_eq!(parse_grpc_timeout("2H"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_grpc_timeout("3M"), Some(Duration::from_secs(180)));
        assert_eq!(parse_grpc_timeout("1S"), Some(Duration::from_secs(1)));
        assert_eq!(parse_grpc_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_grpc_timeout("40u"), Some(Duration::from_micros(40)));
        assert_eq!(parse_grpc_timeout("99999999n"), Some(Duration::from_nanos(99_999_999)));
    }

    #[test]
    fn rejects_malformed_timeouts() {
        for value in ["", "m", "10", "10x", "-5m", "123456789m", "1.5S", "5é"] {
            assert_eq!(parse_grpc_timeout(value), None, "{value:?}");
        }
    }

    #[tokio::test]
    async fn deadline_comes_from_the_timeout_header() {
        let mut headers = HeaderMap::new();
        headers.insert(GRPC_TIMEOUT_HEADER, HeaderValue::from_static("500m"));

        let ctx = CallContext::from_headers("/pkg.Svc/Call", &headers);
        assert_eq!(ctx.method(), "/pkg.Svc/Call");
        let remaining = ctx.time_remaining().unwrap();
        assert!(remaining <= Duration::from_millis(500));
        assert!(remaining > Duration::from_millis(400));

        let ctx = CallContext::from_headers("/pkg.Svc/Call", &HeaderMap::new());
        assert!(ctx.deadline().is_none());
    }

    #[tokio::test]
    async fn explicit_deadline_overrides_and_saturates() {
        let deadline = Instant::now() + Duration::from_secs(2);
        let ctx = CallContext::new("/pkg.Svc/Call").with_deadline(deadline);
        assert_eq!(ctx.deadline(), Some(deadline));
        assert!(ctx.time_remaining().unwrap() > Duration::from_secs(1));

        let past = Instant::now()
            .checked_sub(Duration::from_millis(10))
            .unwrap_or_else(Instant::now);
        let ctx = ctx.with_deadline(past);
        assert_eq!(ctx.time_remaining(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn clones_share_cancellation() {
        let ctx = CallContext::new("/pkg.Svc/Call");
        let clone = ctx.clone();
        assert!(!clone.is_cancelled());

        ctx.cancellation().cancel();
        clone.cancelled().await;
        assert!(clone.is_cancelled());
    }
}
