//! Connect targets
//!
//! `ingest://[user[:session]@]host[:port]/channel`, port defaulting to 2077.
//! The credentials part ends at the last `@`, so a session token may itself
//! contain `@`.

use ingest_protocol::ErrorCode;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 2077;
const SCHEME: &str = "ingest://";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlError {
    #[error("URL must start with ingest://")]
    Scheme,

    #[error("missing host")]
    MissingHost,

    #[error("missing channel")]
    MissingChannel,

    #[error("invalid port: {0}")]
    InvalidPort(String),
}

/// Where a session connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    Url(String),
    Host {
        host: String,
        port: u16,
        channel: String,
    },
}

/// Parsed form of a [`ConnectTarget`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub user: Option<String>,
    pub session: Option<String>,
    pub host: String,
    pub port: u16,
    pub channel: String,
}

impl ConnectTarget {
    pub fn endpoint(&self) -> Result<Endpoint, UrlError> {
        match self {
            ConnectTarget::Url(url) => parse_url(url),
            ConnectTarget::Host {
                host,
                port,
                channel,
            } => {
                if host.is_empty() {
                    return Err(UrlError::MissingHost);
                }
                if channel.is_empty() {
                    return Err(UrlError::MissingChannel);
                }
                Ok(Endpoint {
                    user: None,
                    session: None,
                    host: host.clone(),
                    port: *port,
                    channel: channel.clone(),
                })
            }
        }
    }
}

impl From<&str> for ConnectTarget {
    fn from(url: &str) -> Self {
        ConnectTarget::Url(url.to_string())
    }
}

impl From<String> for ConnectTarget {
    fn from(url: String) -> Self {
        ConnectTarget::Url(url)
    }
}

impl From<UrlError> for ErrorCode {
    fn from(error: UrlError) -> Self {
        tracing::warn!("bad connect target: {}", error);
        ErrorCode::InvalidParameter
    }
}

pub fn parse_url(url: &str) -> Result<Endpoint, UrlError> {
    let rest = url.strip_prefix(SCHEME).ok_or(UrlError::Scheme)?;

    let (authority, channel) = rest.split_once('/').ok_or(UrlError::MissingChannel)?;
    if channel.is_empty() {
        return Err(UrlError::MissingChannel);
    }

    let (credentials, host_port) = match authority.rfind('@') {
        Some(at) => (Some(&authority[..at]), &authority[at + 1..]),
        None => (None, authority),
    };
    let (user, session) = match credentials {
        Some(credentials) => match credentials.split_once(':') {
            Some((user, session)) => (non_empty(user), non_empty(session)),
            None => (non_empty(credentials), None),
        },
        None => (None, None),
    };

    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| UrlError::InvalidPort(port.to_string()))?;
            (host, port)
        }
        None => (host_port, DEFAULT_PORT),
    };
    if host.is_empty() {
        return Err(UrlError::MissingHost);
    }

    Ok(Endpoint {
        user,
        session,
        host: host.to_string(),
        port,
        channel: channel.to_string(),
    })
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_url() {
        let endpoint = parse_url("ingest://example.com/live").unwrap();
        assert_eq!(endpoint.host, "example.com");
        assert_eq!(endpoint.port, DEFAULT_PORT);
        assert_eq!(endpoint.channel, "live");
        assert_eq!(endpoint.user, None);
    }

    #[test]
    fn test_full_url() {
        let endpoint = parse_url("ingest://alice:se@cret@10.0.0.1:3000/news/hd").unwrap();
        assert_eq!(endpoint.user.as_deref(), Some("alice"));
        assert_eq!(endpoint.session.as_deref(), Some("se@cret"));
        assert_eq!(endpoint.host, "10.0.0.1");
        assert_eq!(endpoint.port, 3000);
        assert_eq!(endpoint.channel, "news/hd");
    }

    #[test]
    fn test_invalid_urls() {
        assert_eq!(parse_url("http://host/ch"), Err(UrlError::Scheme));
        assert_eq!(parse_url("ingest://host"), Err(UrlError::MissingChannel));
        assert_eq!(parse_url("ingest://:2077/ch"), Err(UrlError::MissingHost));
        assert!(matches!(
            parse_url("ingest://host:99999/ch"),
            Err(UrlError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_host_target() {
        let target = ConnectTarget::Host {
            host: "127.0.0.1".into(),
            port: 5000,
            channel: "ch".into(),
        };
        assert_eq!(target.endpoint().unwrap().port, 5000);
    }
}
