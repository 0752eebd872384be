use core::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use http::Version;
use serde::{Deserialize, Serialize};

/// HTTP protocol variant a check runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "http1.0")]
    Http1_0,
    #[serde(rename = "http1.0-tls")]
    Http1_0Tls,
    #[serde(rename = "http1.1")]
    Http1_1,
    #[serde(rename = "http1.1-tls")]
    Http1_1Tls,
    #[serde(rename = "h2")]
    H2,
    #[serde(rename = "h2c")]
    H2c,
    #[serde(rename = "h3")]
    H3,
}

impl Protocol {
    /// All protocols, in the order they are listed on the command line.
    pub const ALL: [Protocol; 7] = [
        Protocol::Http1_0,
        Protocol::Http1_0Tls,
        Protocol::Http1_1,
        Protocol::Http1_1Tls,
        Protocol::H2,
        Protocol::H2c,
        Protocol::H3,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http1_0 => "http1.0",
            Self::Http1_0Tls => "http1.0-tls",
            Self::Http1_1 => "http1.1",
            Self::Http1_1Tls => "http1.1-tls",
            Self::H2 => "h2",
            Self::H2c => "h2c",
            Self::H3 => "h3",
        }
    }

    #[inline]
    pub const fn uses_tls(&self) -> bool {
        matches!(self, Self::Http1_0Tls | Self::Http1_1Tls | Self::H2 | Self::H3)
    }

    /// Wire version the server is expected to answer with.
    pub const fn version(&self) -> Version {
        match self {
            Self::Http1_0 | Self::Http1_0Tls => Version::HTTP_10,
            Self::Http1_1 | Self::Http1_1Tls => Version::HTTP_11,
            Self::H2 | Self::H2c => Version::HTTP_2,
            Self::H3 => Version::HTTP_3,
        }
    }

    /// Same as [`Protocol::version`], rendered the way it appears in check
    /// messages.
    pub fn version_str(&self) -> &'static str {
        version_str(self.version())
    }

    /// Whether the client can report the moment a request has been fully
    /// written to the wire.
    ///
    /// The QUIC stack gives no such signal, so h3 checks fall back to a fixed
    /// wait.
    #[inline]
    pub const fn supports_write_instrumentation(&self) -> bool {
        !matches!(self, Self::H3)
    }

    /// HTTP/1.0 has no chunked transfer coding, so bodies of unknown length
    /// cannot be streamed.
    #[inline]
    pub const fn supports_chunked_body(&self) -> bool {
        !self.is_http1_0()
    }

    #[inline]
    pub const fn is_http1_0(&self) -> bool {
        matches!(self, Self::Http1_0 | Self::Http1_0Tls)
    }
}

pub fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_09 {
        "HTTP/0.9"
    } else if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else if version == Version::HTTP_11 {
        "HTTP/1.1"
    } else if version == Version::HTTP_2 {
        "HTTP/2.0"
    } else if version == Version::HTTP_3 {
        "HTTP/3.0"
    } else {
        "HTTP/?"
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown protocol: {s}"))
    }
}
