use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::resolve::Route;

pub const DEFAULT_ADDR: &str = ":8080";
pub const DEFAULT_ROOT_ROUTE: &str = "/";

/// Separator between the URL prefix and the filesystem path of a route.
pub const ROUTE_SEPARATOR: char = '=';

/// Raw settings as read from a config file or collected from flags.
///
/// Every field is optional so that two sources can be layered with
/// [`Settings::overlay`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Listen address, `host:port` or `:port`
    pub addr: Option<String>,
    /// Port overriding the one in `addr`
    pub port: Option<u16>,
    /// Accept multipart uploads into served directories
    pub uploads: Option<bool>,
    /// Disable all log output
    pub quiet: Option<bool>,
    /// Route definitions `ROUTE=PATH` or `PATH`
    pub routes: Vec<String>,
    /// Path redirected to the first route when it is not a route itself
    pub root_route: Option<String>,
    pub ssl_cert: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
}

impl Settings {
    /// Load settings from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Layer `other` on top of `self`: values set in `other` win, route lists
    /// are concatenated.
    pub fn overlay(mut self, other: Settings) -> Settings {
        self.routes.extend(other.routes);
        Settings {
            addr: other.addr.or(self.addr),
            port: other.port.or(self.port),
            uploads: other.uploads.or(self.uploads),
            quiet: other.quiet.or(self.quiet),
            routes: self.routes,
            root_route: other.root_route.or(self.root_route),
            ssl_cert: other.ssl_cert.or(self.ssl_cert),
            ssl_key: other.ssl_key.or(self.ssl_key),
        }
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet.unwrap_or(false)
    }

    pub fn into_server_config(self) -> Result<ServerConfig, ConfigError> {
        let addr = resolve_addr(self.addr.as_deref().unwrap_or(DEFAULT_ADDR), self.port)?;

        let mut definitions = self.routes;
        if definitions.is_empty() {
            definitions.push(".".to_string());
        }
        let routes = definitions
            .iter()
            .map(|definition| parse_route(definition))
            .collect::<Result<Vec<_>, _>>()?;

        let non_empty = |path: Option<PathBuf>| path.filter(|p| !p.as_os_str().is_empty());
        let tls = match (non_empty(self.ssl_cert), non_empty(self.ssl_key)) {
            (Some(certificate), Some(key)) => Some(TlsConfig { certificate, key }),
            (None, None) => None,
            _ => {
                warn!("TLS needs both a certificate and a key; serving plain HTTP");
                None
            }
        };

        Ok(ServerConfig {
            addr,
            routes,
            allow_upload: self.uploads.unwrap_or(false),
            root_route: self
                .root_route
                .unwrap_or_else(|| DEFAULT_ROOT_ROUTE.to_string()),
            tls,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// Resolved, immutable server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub routes: Vec<Route>,
    pub allow_upload: bool,
    pub root_route: String,
    pub tls: Option<TlsConfig>,
}

impl ServerConfig {
    /// Configuration serving `routes` on the default address.
    pub fn new(routes: Vec<Route>, allow_upload: bool) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            routes,
            allow_upload,
            root_route: DEFAULT_ROOT_ROUTE.to_string(),
            tls: None,
        }
    }
}

/// Parse `ROUTE=PATH`, `=PATH` or `PATH`.
///
/// Without an explicit route the prefix is the base name of the absolute
/// path, e.g. `./docs` becomes `/docs/`.
pub fn parse_route(definition: &str) -> Result<Route, ConfigError> {
    let (prefix, path) = match definition.find(ROUTE_SEPARATOR) {
        Some(i) if i > 0 => (
            Some(&definition[..i]),
            &definition[i + ROUTE_SEPARATOR.len_utf8()..],
        ),
        _ => (
            None,
            definition.strip_prefix(ROUTE_SEPARATOR).unwrap_or(definition),
        ),
    };

    let root = absolute_path(Path::new(path)).map_err(|err| ConfigError::InvalidRoute {
        definition: definition.to_string(),
        reason: err.to_string(),
    })?;

    let prefix = match prefix {
        Some(prefix) => prefix.to_string(),
        None => match root.file_name() {
            Some(name) => format!("/{}/", name.to_string_lossy()),
            None => DEFAULT_ROOT_ROUTE.to_string(),
        },
    };

    Ok(Route::new(prefix, root))
}

/// Absolute, lexically normalized form of `path`.
fn absolute_path(path: &Path) -> io::Result<PathBuf> {
    let path = if path.as_os_str().is_empty() {
        Path::new(".")
    } else {
        path
    };

    let absolute = std::path::absolute(path)?;
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    Ok(normalized)
}

/// Resolve the listen address. `:PORT` binds every interface; `port`
/// replaces whatever port `addr` names.
pub fn resolve_addr(addr: &str, port: Option<u16>) -> Result<SocketAddr, ConfigError> {
    let addr = if addr.is_empty() { DEFAULT_ADDR } else { addr };
    let candidate = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };

    let invalid = |reason: String| ConfigError::InvalidAddress {
        addr: addr.to_string(),
        reason,
    };

    let mut resolved = match candidate.parse::<SocketAddr>() {
        Ok(resolved) => resolved,
        Err(_) => candidate
            .to_socket_addrs()
            .map_err(|err| invalid(err.to_string()))?
            .next()
            .ok_or_else(|| invalid("no addresses found".to_string()))?,
    };

    if let Some(port) = port.filter(|p| *p != 0) {
        resolved.set_port(port);
    }

    Ok(resolved)
}
