//! Transport configuration and its resolution from arguments, environment, and defaults.
use std::{
    fmt,
    path::{Path, PathBuf},
};

use thiserror::Error;

/// Default host used when no transport target has been configured.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port used when no transport target has been configured, or when only a host was given.
pub const DEFAULT_PORT: u16 = 8125;

const ENV_URL: &str = "DD_DOGSTATSD_URL";
const ENV_HOST: &str = "DD_AGENT_HOST";
const ENV_PORT: &str = "DD_DOGSTATSD_PORT";
const ENV_SOCKET: &str = "DD_DOGSTATSD_SOCKET";

const UDP_SCHEME: &str = "udp://";
const UDS_SCHEME: &str = "unix://";

/// Errors that could occur while resolving the transport configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Both a UDP target and a Unix domain socket path were given at the same precedence tier.
    #[error(
        "both UDP (host/port {host}:{port}) and UDS (socket path {socket_path}) were given as {tier}; use only one or the other"
    )]
    ConflictingTransport {
        /// Where the conflicting values came from.
        tier: Tier,
        /// Host that was given, or `-` if only a port was given.
        host: String,
        /// Port that was given, or `-` if only a host was given.
        port: String,
        /// Socket path that was given.
        socket_path: String,
    },

    /// The combined URL override could not be parsed.
    #[error("invalid DD_DOGSTATSD_URL value '{url}': {reason}")]
    InvalidUrl {
        /// The offending value.
        url: String,
        /// Details about the parsing failure.
        reason: &'static str,
    },

    /// A port value could not be parsed.
    #[error("invalid port '{value}'")]
    InvalidPort {
        /// The offending value.
        value: String,
    },
}

/// Precedence tier a transport setting was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    /// Explicit constructor/builder arguments.
    Arguments,

    /// Environment variables.
    Environment,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Arguments => f.write_str("constructor arguments"),
            Tier::Environment => f.write_str("environment variables"),
        }
    }
}

/// Transport used to reach the DogStatsD server.
///
/// Exactly one transport is ever active: either a network datagram target (UDP), or a local Unix domain datagram
/// socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportConfig {
    /// UDP datagrams sent to `host:port`.
    Udp {
        /// Target host, either an IP address or a resolvable name.
        host: String,
        /// Target port.
        port: u16,
    },

    /// Unix domain datagrams (`SOCK_DGRAM`) sent to the socket at `socket_path`.
    Uds {
        /// Filesystem path of the server socket.
        socket_path: PathBuf,
    },
}

impl TransportConfig {
    /// Returns the transport ID: `udp` or `uds`.
    ///
    /// This is used both for choosing transport-specific defaults, and for tagging internal telemetry.
    pub const fn transport_id(&self) -> &'static str {
        match self {
            TransportConfig::Udp { .. } => "udp",
            TransportConfig::Uds { .. } => "uds",
        }
    }

    /// Returns the target host, if the transport is UDP.
    pub fn host(&self) -> Option<&str> {
        match self {
            TransportConfig::Udp { host, .. } => Some(host),
            TransportConfig::Uds { .. } => None,
        }
    }

    /// Returns the target port, if the transport is UDP.
    pub fn port(&self) -> Option<u16> {
        match self {
            TransportConfig::Udp { port, .. } => Some(*port),
            TransportConfig::Uds { .. } => None,
        }
    }

    /// Returns the socket path, if the transport is UDS.
    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            TransportConfig::Udp { .. } => None,
            TransportConfig::Uds { socket_path } => Some(socket_path),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Udp { host: DEFAULT_HOST.to_string(), port: DEFAULT_PORT }
    }
}

/// Discrete settings collected from a single precedence tier.
struct TierSettings {
    url: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    socket_path: Option<PathBuf>,
}

impl TierSettings {
    fn try_resolve(mut self, tier: Tier) -> Result<Option<TransportConfig>, ConfigError> {
        let has_udp_target = self.host.is_some() || self.port.is_some();
        if let Some(socket_path) = self.socket_path.as_ref().filter(|_| has_udp_target) {
            return Err(ConfigError::ConflictingTransport {
                tier,
                host: self.host.clone().unwrap_or_else(|| "-".to_string()),
                port: self.port.map_or_else(|| "-".to_string(), |p| p.to_string()),
                socket_path: socket_path.display().to_string(),
            });
        }

        // The combined URL wins over the discrete values of the same tier.
        if let Some(url) = self.url.take() {
            return parse_url(&url).map(Some);
        }

        if has_udp_target {
            return Ok(Some(TransportConfig::Udp {
                host: self.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port: self.port.unwrap_or(DEFAULT_PORT),
            }));
        }

        Ok(self.socket_path.map(|socket_path| TransportConfig::Uds { socket_path }))
    }
}

/// Resolves the transport configuration, reading overrides from the process environment.
///
/// See [`resolve_with_env`] for the precedence rules.
///
/// # Errors
///
/// See [`resolve_with_env`].
pub fn resolve(
    host: Option<&str>,
    port: Option<u16>,
    socket_path: Option<&Path>,
) -> Result<TransportConfig, ConfigError> {
    resolve_with_env(host, port, socket_path, |name| std::env::var(name).ok())
}

/// Resolves the transport configuration, reading overrides through `env`.
///
/// Precedence, highest first:
///
/// 1. the explicit `host`, `port`, and `socket_path` arguments
/// 2. `DD_DOGSTATSD_URL`, in the form of `udp://<host>[:<port>]` or `unix://<path>`
/// 3. `DD_AGENT_HOST` and `DD_DOGSTATSD_PORT`, or `DD_DOGSTATSD_SOCKET`
/// 4. `127.0.0.1:8125` over UDP
///
/// When only one of host and port is given, the other one is defaulted.
///
/// # Errors
///
/// If a UDP setting and a socket path are both given at the same tier, if the URL override is malformed, or if a port
/// cannot be parsed, an error is returned naming the offending value(s).
pub fn resolve_with_env<F>(
    host: Option<&str>,
    port: Option<u16>,
    socket_path: Option<&Path>,
    env: F,
) -> Result<TransportConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let arguments = TierSettings {
        url: None,
        host: host.map(str::to_string),
        port,
        socket_path: socket_path.map(Path::to_path_buf),
    };
    if let Some(config) = arguments.try_resolve(Tier::Arguments)? {
        return Ok(config);
    }

    let environment = TierSettings {
        url: env(ENV_URL),
        host: env(ENV_HOST),
        port: env(ENV_PORT).map(|p| parse_port(&p)).transpose()?,
        socket_path: env(ENV_SOCKET).map(PathBuf::from),
    };
    if let Some(config) = environment.try_resolve(Tier::Environment)? {
        return Ok(config);
    }

    Ok(TransportConfig::default())
}

fn parse_port(value: &str) -> Result<u16, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidPort { value: value.to_string() })
}

fn parse_url(url: &str) -> Result<TransportConfig, ConfigError> {
    if let Some(target) = url.strip_prefix(UDP_SCHEME) {
        let mut parts = target.split(':');
        let host = parts.next().unwrap_or_default().trim();
        let port = parts.next();
        if parts.next().is_some() {
            return Err(ConfigError::InvalidUrl {
                url: url.to_string(),
                reason: "wrong format for a UDP connection, expected udp://<host>[:<port>]",
            });
        }

        let port = port.map(parse_port).transpose()?.unwrap_or(DEFAULT_PORT);
        let host = if host.is_empty() { DEFAULT_HOST } else { host };

        return Ok(TransportConfig::Udp { host: host.to_string(), port });
    }

    if let Some(path) = url.strip_prefix(UDS_SCHEME) {
        if path.is_empty() {
            return Err(ConfigError::InvalidUrl {
                url: url.to_string(),
                reason: "missing socket path, expected unix://<path>",
            });
        }

        return Ok(TransportConfig::Uds { socket_path: PathBuf::from(path) });
    }

    Err(ConfigError::InvalidUrl {
        url: url.to_string(),
        reason: "scheme must be udp:// or unix://",
    })
}
