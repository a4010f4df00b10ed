#![forbid(unsafe_code)]

pub mod endpoint {
	use std::fmt;
	use std::net::SocketAddr;
	use std::str::FromStr;

	use thiserror::Error;

	#[derive(Debug, Error, Clone, PartialEq, Eq)]
	pub enum EndpointError {
		#[error("endpoint must be non-empty (expected quic://host:port)")]
		Empty,
		#[error("missing quic:// scheme: {0}")]
		Scheme(String),
		#[error("path, query and fragment are not allowed: {0}")]
		TrailingParts(String),
		#[error("missing :port: {0}")]
		MissingPort(String),
		#[error("invalid host: {0}")]
		Host(String),
		#[error("IPv6 hosts must be bracketed like quic://[::1]:18300: {0}")]
		UnbracketedIpv6(String),
		#[error("invalid port (expected 1..=65535): {0}")]
		Port(String),
		#[error("host is not an IP literal: {0}")]
		NotIpLiteral(String),
	}

	/// `quic://host:port` as accepted by `--bind` and the client config.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct QuicEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl QuicEndpoint {
		/// `host:port`; bracketed IPv6 stays bracketed.
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Host without IPv6 brackets, suitable for TLS server names.
		pub fn server_name(&self) -> &str {
			self.host
				.strip_prefix('[')
				.and_then(|h| h.strip_suffix(']'))
				.unwrap_or(&self.host)
		}

		pub fn socket_addr(&self) -> Result<SocketAddr, EndpointError> {
			self.hostport()
				.parse()
				.map_err(|_| EndpointError::NotIpLiteral(self.host.clone()))
		}

		pub fn parse(s: &str) -> Result<Self, EndpointError> {
			let s = s.trim();
			if s.is_empty() {
				return Err(EndpointError::Empty);
			}

			let rest = s
				.strip_prefix("quic://")
				.ok_or_else(|| EndpointError::Scheme(s.to_string()))?;

			if rest.contains(['/', '?', '#']) {
				return Err(EndpointError::TrailingParts(s.to_string()));
			}

			let (host, port) = rest
				.rsplit_once(':')
				.ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(EndpointError::Host(s.to_string()));
			}
			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(EndpointError::UnbracketedIpv6(s.to_string()));
			}

			let port = match port.trim().parse::<u16>() {
				Ok(p) if p != 0 => p,
				_ => return Err(EndpointError::Port(s.to_string())),
			};

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	impl FromStr for QuicEndpoint {
		type Err = EndpointError;

		fn from_str(s: &str) -> Result<Self, Self::Err> {
			Self::parse(s)
		}
	}

	impl fmt::Display for QuicEndpoint {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			write!(f, "quic://{}:{}", self.host, self.port)
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_ipv4_and_dns() {
			let e = QuicEndpoint::parse("quic://127.0.0.1:18300").unwrap();
			assert_eq!(e.hostport(), "127.0.0.1:18300");
			assert_eq!(e.socket_addr().unwrap().port(), 18300);

			let e = QuicEndpoint::parse("quic://sync.internal:443").unwrap();
			assert_eq!(e.server_name(), "sync.internal");
			assert!(matches!(e.socket_addr(), Err(EndpointError::NotIpLiteral(_))));
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e: QuicEndpoint = "quic://[::1]:18300".parse().unwrap();
			assert_eq!(e.host, "[::1]");
			assert_eq!(e.server_name(), "::1");
			assert_eq!(e.to_string(), "quic://[::1]:18300");
		}

		#[test]
		fn rejects_malformed() {
			assert_eq!(QuicEndpoint::parse("  "), Err(EndpointError::Empty));
			assert!(matches!(
				QuicEndpoint::parse("tcp://1.2.3.4:1"),
				Err(EndpointError::Scheme(_))
			));
			assert!(matches!(
				QuicEndpoint::parse("quic://::1:18300"),
				Err(EndpointError::UnbracketedIpv6(_))
			));
			assert!(matches!(
				QuicEndpoint::parse("quic://127.0.0.1:18300/x"),
				Err(EndpointError::TrailingParts(_))
			));
			assert!(matches!(QuicEndpoint::parse("quic://127.0.0.1:0"), Err(EndpointError::Port(_))));
			assert!(matches!(
				QuicEndpoint::parse("quic://127.0.0.1"),
				Err(EndpointError::MissingPort(_))
			));
		}
	}
}

pub mod time {
	use std::time::{SystemTime, UNIX_EPOCH};

	pub fn unix_ms_now() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_millis() as i64)
			.unwrap_or(0)
	}

	/// Seconds since the epoch; update envelopes carry dates at this resolution.
	pub fn unix_secs_now() -> i64 {
		unix_ms_now() / 1000
	}
}
