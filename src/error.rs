use std::fmt;
use std::io;

/// The error kinds of §7: fatal ones (`Graph`, `Bind`, `Poll`) abort the
/// process; the rest are local to a single transfer and are logged and
/// swallowed by the driver.
#[derive(Debug)]
pub enum TgenError {
    Graph(String),
    Bind(io::Error),
    Connect(io::Error),
    Proxy(String),
    Protocol(String),
    Io(io::Error),
    Pool,
    Poll(io::Error),
}

impl TgenError {
    /// True for the errors that must abort the whole driver rather than
    /// just the transfer or connect attempt that raised them.
    pub fn is_fatal(&self) -> bool {
        matches!(*self, TgenError::Graph(_) | TgenError::Bind(_) | TgenError::Poll(_))
    }
}

impl fmt::Display for TgenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TgenError::Graph(ref s) => write!(f, "graph error: {}", s),
            TgenError::Bind(ref e) => write!(f, "bind error: {}", e),
            TgenError::Connect(ref e) => write!(f, "connect error: {}", e),
            TgenError::Proxy(ref s) => write!(f, "socks5 proxy error: {}", s),
            TgenError::Protocol(ref s) => write!(f, "protocol error: {}", s),
            TgenError::Io(ref e) => write!(f, "io error: {}", e),
            TgenError::Pool => write!(f, "peer pool is empty"),
            TgenError::Poll(ref e) => write!(f, "poller error: {}", e),
        }
    }
}

impl std::error::Error for TgenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            TgenError::Bind(ref e) |
            TgenError::Connect(ref e) |
            TgenError::Io(ref e) |
            TgenError::Poll(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TgenError {
    fn from(e: io::Error) -> TgenError {
        TgenError::Io(e)
    }
}
