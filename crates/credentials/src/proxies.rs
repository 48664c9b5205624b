//! Proxy list file parsing
//!
//! One endpoint per line, blank lines and `#` comments ignored. Accepted forms:
//!
//! - `host:port`
//! - `host:port:user:pass`
//! - `user:pass@host:port`
//! - `scheme://[user:pass@]host:port` (http, https, socks5)

use std::path::{Path, PathBuf};

use identity_pool::EgressSource;
use platform::{BoxFuture, EgressRoute};
use tracing::info;
use url::Url;

use crate::error::{Error, Result};

const SUPPORTED_SCHEMES: &[&str] = &["http", "https", "socks5", "socks5h"];

/// Parse a single proxy entry. `line` is 1-based, used in error messages.
pub fn parse_proxy_line(entry: &str, line: usize) -> Result<EgressRoute> {
    let entry = entry.trim();
    let invalid = |reason: &str| Error::InvalidProxy {
        line,
        reason: reason.to_string(),
    };

    if entry.contains("://") || entry.contains('@') {
        let with_scheme = if entry.contains("://") {
            entry.to_string()
        } else {
            format!("http://{entry}")
        };
        let url = Url::parse(&with_scheme).map_err(|e| invalid(&e.to_string()))?;
        if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
            return Err(invalid(&format!("unsupported scheme {}", url.scheme())));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;
        let mut route = EgressRoute::new(host, port);
        route.scheme = url.scheme().to_string();
        if !url.username().is_empty() {
            route = route.with_auth(url.username(), url.password().unwrap_or_default());
        }
        return Ok(route);
    }

    let parts: Vec<&str> = entry.split(':').collect();
    let (host, port) = match parts.as_slice() {
        [host, port] | [host, port, _, _] => (*host, *port),
        _ => return Err(invalid("expected host:port or host:port:user:pass")),
    };
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| invalid(&format!("invalid port {port}")))?;
    let route = EgressRoute::new(host, port);
    Ok(match parts.as_slice() {
        [_, _, user, pass] => route.with_auth(*user, *pass),
        _ => route,
    })
}

/// Parse a whole proxy file body.
pub fn parse_proxy_list(contents: &str) -> Result<Vec<EgressRoute>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, l)| {
            let l = l.trim();
            !l.is_empty() && !l.starts_with('#')
        })
        .map(|(idx, l)| parse_proxy_line(l, idx + 1))
        .collect()
}

/// Proxy file source. A missing path means no proxies (direct egress).
pub struct ProxyList {
    path: Option<PathBuf>,
}

impl ProxyList {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub async fn load(path: &Path) -> Result<Vec<EgressRoute>> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Io(format!("reading proxy file: {e}")))?;
        let routes = parse_proxy_list(&contents)?;
        info!(path = %path.display(), proxies = routes.len(), "loaded proxy list");
        Ok(routes)
    }
}

impl EgressSource for ProxyList {
    fn load_routes(&self) -> BoxFuture<'_, identity_pool::Result<Vec<EgressRoute>>> {
        Box::pin(async move {
            match &self.path {
                Some(path) => Ok(Self::load(path).await?),
                None => Ok(Vec::new()),
            }
        })
    }
}
