use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use anyhow::{anyhow, bail};
use tracing::debug;

/// A peer address as the application specifies it: `host[:port][?]`.
///
/// The host is a DNS name, an IPV4 address or an IPV6 address (in brackets if a port is
///  given). A trailing `?` marks the port as a guess: the connection then probes ports around it
///  until the peer answers. This helps with NATs that remap ports in a predictable way.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
    pub port_guessing: bool,
}

impl PeerAddress {
    pub fn parse(s: &str, default_port: u16) -> anyhow::Result<PeerAddress> {
        let s = s.trim();
        let (s, port_guessing) = match s.strip_suffix('?') {
            Some(s) => (s, true),
            None => (s, false),
        };

        let (host, port) = if let Some(bracketed) = s.strip_prefix('[') {
            let (host, rest) = bracketed.split_once(']')
                .ok_or_else(|| anyhow!("unterminated IPV6 address in {:?}", s))?;
            let port = match rest {
                "" => None,
                _ => Some(rest.strip_prefix(':')
                    .ok_or_else(|| anyhow!("unexpected characters after IPV6 address in {:?}", s))?),
            };
            (host, port)
        }
        else if s.matches(':').count() > 1 {
            // bare IPV6 address, no port
            (s, None)
        }
        else {
            match s.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() {
            bail!("peer address {:?} has no host", s);
        }
        let port = match port {
            Some(port) => port.parse::<u16>()
                .map_err(|e| anyhow!("invalid port {:?} in peer address {:?}: {}", port, s, e))?,
            None => default_port,
        };
        if port == 0 {
            bail!("port 0 is not a valid peer port");
        }

        Ok(PeerAddress {
            host: host.to_string(),
            port,
            port_guessing,
        })
    }

    /// Resolves the host, using the first address it resolves to
    pub async fn resolve(&self) -> anyhow::Result<SocketAddr> {
        let mut resolved = tokio::net::lookup_host((self.host.as_str(), self.port)).await?;
        let addr = resolved.next()
            .ok_or_else(|| anyhow!("{} does not resolve to any address", self.host))?;
        debug!("resolved {} to {:?}", self, addr);
        Ok(addr)
    }
}

impl Display for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)?;
        }
        else {
            write!(f, "{}:{}", self.host, self.port)?;
        }
        if self.port_guessing {
            write!(f, "?")?;
        }
        Ok(())
    }
}
