use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::Method,
    response::{IntoResponse, Response},
};
use tokio::fs;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{error, info, warn};

use crate::archive::{self, ArchiveFormat};
use crate::error::ServeError;
use crate::listing::{self, TAR_GZ_KEY, ZIP_KEY};
use crate::resolve::Route;
use crate::upload;

/// Request handler bound to one route.
///
/// Holds only immutable configuration, so a single instance is shared by
/// every in-flight request on the route.
#[derive(Debug, Clone)]
pub struct RouteHandler {
    route: Route,
    allow_upload: bool,
}

impl RouteHandler {
    pub fn new(route: Route, allow_upload: bool) -> Self {
        Self {
            route,
            allow_upload,
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn allow_upload(&self) -> bool {
        self.allow_upload
    }

    /// Serve one request. Every failure is turned into a status response here.
    pub async fn handle(&self, request: Request) -> Response {
        let remote = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string())
            .unwrap_or_else(|| "-".to_string());
        info!(
            "[{}] {} {} {}",
            self.route.root().display(),
            remote,
            request.method(),
            request.uri()
        );

        match self.dispatch(request).await {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    ServeError::NotFound(_) | ServeError::Forbidden(_) => warn!("{}", err),
                    _ => error!("{}", err),
                }
                err.into_response()
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Response, ServeError> {
        let path = self.route.resolve(request.uri().path());
        let metadata = fs::metadata(&path)
            .await
            .map_err(|err| ServeError::from_stat(path.clone(), err))?;

        let query = request.uri().query();
        if listing::query_flag(query, ZIP_KEY) {
            return archive::archive_response(path, metadata.is_dir(), ArchiveFormat::Zip).await;
        }
        if listing::query_flag(query, TAR_GZ_KEY) {
            return archive::archive_response(path, metadata.is_dir(), ArchiveFormat::TarGz).await;
        }

        if self.allow_upload && metadata.is_dir() && request.method() == Method::POST {
            return upload::receive(&path, request).await;
        }

        if metadata.is_dir() {
            let html = listing::listing_response(
                request.uri(),
                self.route.root(),
                &path,
                self.allow_upload,
            )
            .await?;
            return Ok(html.into_response());
        }

        serve_file(&path, request).await
    }
}

/// Raw file transfer with content-type guessing, conditional requests and
/// byte ranges. Every method except HEAD is answered as a GET.
async fn serve_file(path: &Path, mut request: Request) -> Result<Response, ServeError> {
    if request.method() != Method::HEAD {
        *request.method_mut() = Method::GET;
    }
    let response = match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    Ok(response.map(Body::new))
}

/// axum entry point for a route's handler.
pub async fn serve(State(handler): State<Arc<RouteHandler>>, request: Request) -> Response {
    handler.handle(request).await
}
