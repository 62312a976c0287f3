//! URI router for `route` messages.
//!
//! # How matching works (for beginners)
//!
//! A peer sends `{"cmd":"route","payload":{"uri":"/returned/back/42","body":…}}`.
//! The receiving application registers patterns such as `/returned/back/:n`
//! and the router picks the handler to run:
//!
//! 1. The URI path and every pattern are split on `/` into segments (empty
//!    segments included, so a trailing or doubled `/` changes the count).
//! 2. Patterns are tried in registration order; the first one with the same
//!    number of segments whose literal segments match exactly wins.
//! 3. A `:name` segment matches any non-empty segment and its value is stored
//!    in [`RouteTransaction::params`] under `name`.
//! 4. When nothing matches, the not-found handler runs (if one is set).
//!
//! An optional `?a=1&b=2` query string is split off before matching and made
//! available in [`RouteTransaction::query`].
//!
//! The router is generic over a context type `C` handed to every handler, so
//! the client can pass itself (or anything else) without this crate knowing
//! about sockets.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Errors raised while registering routes or running handlers.
#[derive(Debug, Error, PartialEq)]
pub enum RouteError {
    #[error("invalid route pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("route handler failed: {0}")]
    Handler(String),

    #[error("malformed route message: {0}")]
    MalformedRoute(String),
}

/// Everything a handler knows about the request it is serving.
#[derive(Debug, Clone)]
pub struct RouteTransaction<C> {
    /// The full URI as received, query string included.
    pub uri: String,
    /// Values captured by `:name` segments.
    pub params: HashMap<String, String>,
    /// Key/value pairs from the query string.
    pub query: HashMap<String, String>,
    pub body: Option<Value>,
    pub context: C,
}

/// Result of [`Router::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A registered pattern matched and its handler ran.
    Matched(String),
    /// No pattern matched and the not-found handler ran.
    NotFound,
    /// No pattern matched and no not-found handler is set.
    Unmatched,
}

/// A route handler.
///
/// Any `Fn(RouteTransaction<C>) -> impl Future<Output = Result<(), RouteError>>`
/// closure implements this trait, so most callers never name it.
#[async_trait]
pub trait RouteHandler<C: Send + 'static>: Send + Sync {
    async fn handle(&self, trx: RouteTransaction<C>) -> Result<(), RouteError>;
}

#[async_trait]
impl<C, F, Fut> RouteHandler<C> for F
where
    C: Send + 'static,
    F: Fn(RouteTransaction<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), RouteError>> + Send + 'static,
{
    async fn handle(&self, trx: RouteTransaction<C>) -> Result<(), RouteError> {
        (self)(trx).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

struct Route<C: Send + 'static> {
    pattern: String,
    segments: Vec<Segment>,
    handler: Arc<dyn RouteHandler<C>>,
}

/// Ordered table of `(pattern, handler)` pairs plus a not-found handler.
pub struct Router<C: Send + 'static> {
    routes: Vec<Route<C>>,
    not_found: Option<Arc<dyn RouteHandler<C>>>,
}

impl<C: Send + 'static> Default for Router<C> {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            not_found: None,
        }
    }
}

impl<C: Send + 'static> Router<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a route.  Earlier registrations take precedence.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidPattern`] if the pattern does not start
    /// with `/`, contains a query string, has an unnamed `:` segment, or
    /// repeats a parameter name.
    pub fn register<H>(&mut self, pattern: &str, handler: H) -> Result<(), RouteError>
    where
        H: RouteHandler<C> + 'static,
    {
        let segments = parse_pattern(pattern)?;
        self.routes.push(Route {
            pattern: pattern.to_string(),
            segments,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    /// Sets (or replaces) the handler run when no pattern matches.
    pub fn set_not_found<H>(&mut self, handler: H)
    where
        H: RouteHandler<C> + 'static,
    {
        self.not_found = Some(Arc::new(handler));
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Runs the handler for `uri`.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by the selected handler.
    pub async fn dispatch(
        &self,
        uri: &str,
        body: Option<Value>,
        context: C,
    ) -> Result<DispatchOutcome, RouteError> {
        let (path, query_str) = match uri.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (uri, None),
        };
        let parts = split_path(path);
        let query = query_str.map(parse_query).unwrap_or_default();

        for route in &self.routes {
            if let Some(params) = match_segments(&route.segments, &parts) {
                debug!(uri, pattern = %route.pattern, "route matched");
                let trx = RouteTransaction {
                    uri: uri.to_string(),
                    params,
                    query,
                    body,
                    context,
                };
                route.handler.handle(trx).await?;
                return Ok(DispatchOutcome::Matched(route.pattern.clone()));
            }
        }

        match &self.not_found {
            Some(handler) => {
                debug!(uri, "no route matched, running not-found handler");
                let trx = RouteTransaction {
                    uri: uri.to_string(),
                    params: HashMap::new(),
                    query,
                    body,
                    context,
                };
                handler.handle(trx).await?;
                Ok(DispatchOutcome::NotFound)
            }
            None => {
                debug!(uri, "no route matched");
                Ok(DispatchOutcome::Unmatched)
            }
        }
    }
}

// ── Matching helpers ──────────────────────────────────────────────────────────

/// Splits after the leading `/`.  Empty segments are kept, so `/a//b` and
/// `/a/b/` have one more segment than `/a/b`.
fn split_path(path: &str) -> Vec<&str> {
    path.strip_prefix('/').unwrap_or(path).split('/').collect()
}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment>, RouteError> {
    let invalid = |reason: &str| RouteError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    if !pattern.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }
    if pattern.contains('?') {
        return Err(invalid("must not contain a query string"));
    }

    let mut seen = Vec::new();
    let mut segments = Vec::new();
    for part in split_path(pattern) {
        match part.strip_prefix(':') {
            Some("") => return Err(invalid("parameter segment without a name")),
            Some(name) => {
                if seen.contains(&name) {
                    return Err(invalid("duplicate parameter name"));
                }
                seen.push(name);
                segments.push(Segment::Param(name.to_string()));
            }
            None => segments.push(Segment::Literal(part.to_string())),
        }
    }
    Ok(segments)
}

fn match_segments(segments: &[Segment], parts: &[&str]) -> Option<HashMap<String, String>> {
    if segments.len() != parts.len() {
        return None;
    }
    let mut params = HashMap::new();
    for (segment, part) in segments.iter().zip(parts) {
        match segment {
            Segment::Literal(lit) if lit == part => {}
            Segment::Literal(_) => return None,
            Segment::Param(_) if part.is_empty() => return None,
            Segment::Param(name) => {
                params.insert(name.clone(), (*part).to_string());
            }
        }
    }
    Some(params)
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // ── Test doubles ──────────────────────────────────────────────────────────

    #[derive(Default, Clone)]
    struct RecordingHandler {
        calls: Arc<Mutex<Vec<(String, HashMap<String, String>)>>>,
    }

    impl RecordingHandler {
        fn count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn last_params(&self) -> HashMap<String, String> {
            self.calls.lock().unwrap().last().unwrap().1.clone()
        }
    }

    #[async_trait]
    impl RouteHandler<()> for RecordingHandler {
        async fn handle(&self, trx: RouteTransaction<()>) -> Result<(), RouteError> {
            self.calls.lock().unwrap().push((trx.uri, trx.params));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_param_segment_is_captured() {
        // Arrange
        let hit = RecordingHandler::default();
        let mut router = Router::new();
        router.register("/returned/back/:n", hit.clone()).unwrap();

        // Act
        let outcome = router.dispatch("/returned/back/42", None, ()).await.unwrap();

        // Assert
        assert_eq!(outcome, DispatchOutcome::Matched("/returned/back/:n".to_string()));
        assert_eq!(hit.count(), 1);
        assert_eq!(hit.last_params().get("n").map(String::as_str), Some("42"));
    }

    #[tokio::test]
    async fn test_unregistered_uri_runs_not_found_exactly_once() {
        // Arrange
        let hit = RecordingHandler::default();
        let missing = RecordingHandler::default();
        let mut router = Router::new();
        router.register("/returned/back/:n", hit.clone()).unwrap();
        router.set_not_found(missing.clone());

        // Act
        let outcome = router.dispatch("/send/me/back", None, ()).await.unwrap();

        // Assert
        assert_eq!(outcome, DispatchOutcome::NotFound);
        assert_eq!(missing.count(), 1);
        assert_eq!(hit.count(), 0);
    }

    #[tokio::test]
    async fn test_no_not_found_handler_reports_unmatched() {
        let router: Router<()> = Router::new();
        assert_eq!(
            router.dispatch("/anything", None, ()).await.unwrap(),
            DispatchOutcome::Unmatched
        );
    }

    #[tokio::test]
    async fn test_first_registered_pattern_wins() {
        // Arrange
        let literal = RecordingHandler::default();
        let param = RecordingHandler::default();
        let mut router = Router::new();
        router.register("/user/:id", param.clone()).unwrap();
        router.register("/user/me", literal.clone()).unwrap();

        // Act
        router.dispatch("/user/me", None, ()).await.unwrap();

        // Assert
        assert_eq!(param.count(), 1);
        assert_eq!(literal.count(), 0);
    }

    #[tokio::test]
    async fn test_segment_count_must_match() {
        let hit = RecordingHandler::default();
        let mut router = Router::new();
        router.register("/a/:b", hit.clone()).unwrap();

        assert_eq!(router.dispatch("/a", None, ()).await.unwrap(), DispatchOutcome::Unmatched);
        assert_eq!(router.dispatch("/a/b/c", None, ()).await.unwrap(), DispatchOutcome::Unmatched);
        assert_eq!(hit.count(), 0);
    }

    #[tokio::test]
    async fn test_query_string_is_split_off() {
        // Arrange
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let mut router = Router::new();
        router
            .register("/search", move |trx: RouteTransaction<()>| {
                let sink = Arc::clone(&sink);
                async move {
                    *sink.lock().unwrap() = Some(trx.query);
                    Ok::<(), RouteError>(())
                }
            })
            .unwrap();

        // Act
        router.dispatch("/search?q=rust&page=2", None, ()).await.unwrap();

        // Assert
        let query = seen.lock().unwrap().clone().unwrap();
        assert_eq!(query.get("q").map(String::as_str), Some("rust"));
        assert_eq!(query.get("page").map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn test_handler_receives_body_and_context() {
        // Arrange
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let mut router: Router<u64> = Router::new();
        router
            .register("/echo", move |trx: RouteTransaction<u64>| {
                let sink = Arc::clone(&sink);
                async move {
                    *sink.lock().unwrap() = Some((trx.body, trx.context));
                    Ok::<(), RouteError>(())
                }
            })
            .unwrap();

        // Act
        router
            .dispatch("/echo", Some(serde_json::json!({"x": 1})), 7)
            .await
            .unwrap();

        // Assert
        let (body, ctx) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(body, Some(serde_json::json!({"x": 1})));
        assert_eq!(ctx, 7);
    }

    #[tokio::test]
    async fn test_handler_error_is_returned() {
        let mut router: Router<()> = Router::new();
        router
            .register("/fail", |_trx: RouteTransaction<()>| async {
                Err::<(), RouteError>(RouteError::Handler("boom".to_string()))
            })
            .unwrap();

        assert_eq!(
            router.dispatch("/fail", None, ()).await,
            Err(RouteError::Handler("boom".to_string()))
        );
    }

    #[test]
    fn test_invalid_patterns_are_rejected() {
        let mut router: Router<()> = Router::new();
        for bad in ["no/slash", "/a/:", "/a/:x/:x", "/a?b=1"] {
            let result = router.register(bad, RecordingHandler::default());
            assert!(
                matches!(result, Err(RouteError::InvalidPattern { .. })),
                "pattern {bad} should be rejected"
            );
        }
        assert!(router.is_empty());
    }

    #[test]
    fn test_root_pattern_matches_root_uri() {
        let segments = parse_pattern("/").unwrap();
        assert_eq!(segments, vec![Segment::Literal(String::new())]);
        assert!(match_segments(&segments, &split_path("/")).is_some());
        assert!(match_segments(&segments, &split_path("/a")).is_none());
    }

    #[tokio::test]
    async fn test_empty_segments_count_towards_the_segment_total() {
        // Arrange
        let hit = RecordingHandler::default();
        let mut router = Router::new();
        router.register("/returned/back/:n", hit.clone()).unwrap();

        // Act
        let doubled = router.dispatch("/returned//back/42", None, ()).await.unwrap();
        let trailing = router.dispatch("/returned/back/42/", None, ()).await.unwrap();
        let empty_param = router.dispatch("/returned/back/", None, ()).await.unwrap();

        // Assert
        assert_eq!(doubled, DispatchOutcome::Unmatched);
        assert_eq!(trailing, DispatchOutcome::Unmatched);
        assert_eq!(empty_param, DispatchOutcome::Unmatched);
        assert_eq!(hit.count(), 0);
    }
}
