//! Serve local directory trees over HTTP.
//!
//! Each configured route binds a URL prefix to a directory. Requests under the
//! prefix get the raw file, an HTML listing of a directory, a streamed zip or
//! tar.gz archive (`?zip=true`, `?tar.gz=true`), or store a multipart upload
//! when uploads are enabled.

pub mod archive;
pub mod config;
pub mod error;
pub mod handlers;
pub mod listing;
pub mod resolve;
pub mod routes;
pub mod upload;

pub use config::{ServerConfig, Settings};
pub use error::{ConfigError, ServeError};
pub use handlers::RouteHandler;
pub use resolve::Route;
pub use routes::router;
