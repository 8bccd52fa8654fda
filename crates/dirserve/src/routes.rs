use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Redirect, Response},
    routing::any,
};
use tracing::info;

use crate::config::ServerConfig;
use crate::handlers::{self, RouteHandler};

/// One handler per distinct URL prefix, in first-seen order. A later route
/// with the same prefix replaces the earlier one.
fn route_handlers(config: &ServerConfig) -> Vec<Arc<RouteHandler>> {
    let mut handlers: Vec<Arc<RouteHandler>> = Vec::new();
    for route in &config.routes {
        let handler = Arc::new(RouteHandler::new(route.clone(), config.allow_upload));
        match handlers
            .iter_mut()
            .find(|existing| existing.route().url_prefix() == route.url_prefix())
        {
            Some(existing) => *existing = handler,
            None => handlers.push(handler),
        }
    }
    handlers
}

/// 301 from `/prefix` to `/prefix/`, keeping the query string.
async fn add_trailing_slash(uri: Uri) -> Response {
    let mut location = format!("{}/", uri.path());
    if let Some(query) = uri.query() {
        location.push('?');
        location.push_str(query);
    }
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response()
}

/// Build the router serving every configured route.
pub fn router(config: &ServerConfig) -> Router {
    let bound = route_handlers(config);
    let mut router = Router::new();

    for handler in &bound {
        let prefix = handler.route().url_prefix();
        info!(
            "serving local path {} on {}",
            handler.route().root().display(),
            prefix
        );

        let service = any(handlers::serve).with_state(Arc::clone(handler));
        router = router
            .route(prefix, service.clone())
            .route(&format!("{prefix}{{*rest}}"), service);

        let bare = prefix.trim_end_matches('/');
        if !bare.is_empty() {
            router = router.route(bare, any(add_trailing_slash));
        }
    }

    let root_is_served = bound
        .iter()
        .any(|handler| handler.route().url_prefix() == config.root_route);
    if let (Some(first), false) = (bound.first(), root_is_served) {
        let target = first.route().url_prefix().to_string();
        info!("redirecting to {} from {}", target, config.root_route);

        let redirect = move || {
            let target = target.clone();
            async move { Redirect::temporary(&target) }
        };
        router = if config.root_route == "/" {
            router.fallback(redirect)
        } else {
            router.route(&config.root_route, any(redirect))
        };
    }

    router.layer(DefaultBodyLimit::disable())
}
