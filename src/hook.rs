//! Request hook for axum.
//!
//! `attach` installs a middleware that gives every request its own
//! `RequestContext`, marks the request scope as `HttpRequest`, and closes every
//! session the request opened once the response has been produced. Handlers reach
//! the scope through the `RequestScope` extractor.

use crate::scope::{RequestContext, RequestScope, SessionMode};
use crate::session::SessionManager;
use axum::Router;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::middleware::{self, Next};
use axum::response::Response;
use std::sync::Arc;
use tracing::{debug, warn};

/// Install the request hook on `router` and tell `manager` it is present.
pub fn attach<S>(router: Router<S>, manager: Arc<SessionManager>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    manager.set_request_hook_installed(true);
    router.layer(middleware::from_fn_with_state(manager, session_scope))
}

/// Middleware body: request begin / request end.
pub async fn session_scope(
    State(manager): State<Arc<SessionManager>>,
    mut request: Request,
    next: Next,
) -> Response {
    let context = RequestContext::new();
    request.extensions_mut().insert(context.clone());
    let scope = RequestScope::new(context);
    manager.set_session_mode(&scope, SessionMode::HttpRequest);
    debug!(request_id = %scope.context().id(), path = %request.uri().path(), "Request scope opened");

    let response = next.run(request).await;

    if let Err(e) = manager.close_all_sessions(&scope).await {
        warn!(request_id = %scope.context().id(), error = %e, "Failed to close request sessions");
    }
    debug!(request_id = %scope.context().id(), "Request scope closed");
    response
}

impl<S> FromRequestParts<S> for RequestScope
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .map(RequestScope::new)
            .ok_or((
                StatusCode::INTERNAL_SERVER_ERROR,
                "request hook is not installed",
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::scope::ScopeKind;

    #[test]
    fn test_attach_marks_hook_installed() {
        let manager = Arc::new(SessionManager::new(ScopeKind::Request, Settings::default()));
        assert!(!manager.request_hook_installed());
        let _router: Router = attach(Router::new(), Arc::clone(&manager));
        assert!(manager.request_hook_installed());
    }

    #[tokio::test]
    async fn test_extractor_requires_context() {
        let (mut parts, _) = axum::http::Request::new(()).into_parts();
        let rejected = RequestScope::from_request_parts(&mut parts, &()).await;
        assert!(rejected.is_err());

        let context = RequestContext::new();
        parts.extensions.insert(context.clone());
        let scope = RequestScope::from_request_parts(&mut parts, &()).await.unwrap();
        assert!(scope.context().same_request(&context));
    }
}
