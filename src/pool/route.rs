//! Destination identity for pooled connections.
//!
//! A [`Route`] is a `(scheme, host, port)` triple. Both the connection pool
//! and the circuit breaker key their per-destination state by `Route`;
//! connections are never shared across routes.

use std::fmt;
use std::str::FromStr;

/// Error returned when a route string cannot be parsed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid route '{0}': expected [scheme://]host[:port]")]
pub struct InvalidRoute(String);

/// URI scheme of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    /// Default port for the scheme.
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// A pooled destination.
///
/// Immutable once constructed. Used as the key for per-destination pool and
/// breaker state, so it is cheap to hash and compare.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Route {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Plain-HTTP route shorthand.
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::new(Scheme::Http, host, port)
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` form used for socket addresses.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

impl FromStr for Route {
    type Err = InvalidRoute;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = match s.split_once("://") {
            Some(("http", rest)) => (Scheme::Http, rest),
            Some(("https", rest)) => (Scheme::Https, rest),
            Some(_) => return Err(InvalidRoute(s.to_string())),
            None => (Scheme::Http, s),
        };

        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(InvalidRoute(s.to_string()));
        }

        match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| InvalidRoute(s.to_string()))?;
                if host.is_empty() {
                    return Err(InvalidRoute(s.to_string()));
                }
                Ok(Route::new(scheme, host, port))
            }
            None => Ok(Route::new(scheme, rest, scheme.default_port())),
        }
    }
}
