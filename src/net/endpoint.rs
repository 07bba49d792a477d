use crate::{Error, Result};
use std::{fmt, str::FromStr};
use url::Url;

/// The only scheme the transport speaks.
pub const TCP_SCHEME: &str = "tcp";

/// A parsed `tcp://host:port` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| Error::InvalidUri(format!("{uri}: {e}")))?;
        if url.scheme() != TCP_SCHEME {
            return Err(Error::UnsupportedScheme(url.scheme().to_owned()));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(Error::InvalidUri(format!("{uri}: user info is not allowed")));
        }
        if !matches!(url.path(), "" | "/") || url.query().is_some() || url.fragment().is_some() {
            return Err(Error::InvalidUri(format!("{uri}: only host and port are allowed")));
        }
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::InvalidUri(format!("{uri}: missing host")))?;
        let port = url
            .port()
            .ok_or_else(|| Error::InvalidUri(format!("{uri}: missing port")))?;
        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_owned(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{TCP_SCHEME}://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{TCP_SCHEME}://{}:{}", self.host, self.port)
        }
    }
}
