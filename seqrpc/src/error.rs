/// Classifies every failure the runtime can produce.
///
/// The kind is what code matches on; the message carries the detail,
/// including the stable `rpc server:` / `rpc client:` prefixes that travel
/// inside response headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Shutdown,
    Eof,
    ConnectFailed,
    ConnectTimeout,
    Canceled,
    HandleTimeout,
    InvalidMagic,
    InvalidArgument,
    InvalidServiceName,
    InvalidServiceMethod,
    DuplicateService,
    DuplicateMethod,
    ServiceNotFound,
    MethodNotFound,
    SerializeFailed,
    DeserializeFailed,
    SendFailed,
    RecvFailed,
    BindFailed,
    HttpHandshakeFailed,
    InvalidAddress,
    UnsupportedProtocol,
    NoAvailableServers,
    Remote,
}

impl ErrorKind {
    /// The lowercase token a rendered error is tagged with.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Shutdown => "shutdown",
            ErrorKind::Eof => "eof",
            ErrorKind::ConnectFailed => "connect failed",
            ErrorKind::ConnectTimeout => "connect timeout",
            ErrorKind::Canceled => "canceled",
            ErrorKind::HandleTimeout => "handle timeout",
            ErrorKind::InvalidMagic => "invalid magic number",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::InvalidServiceName => "invalid service name",
            ErrorKind::InvalidServiceMethod => "ill-formed service method",
            ErrorKind::DuplicateService => "duplicate service",
            ErrorKind::DuplicateMethod => "duplicate method",
            ErrorKind::ServiceNotFound => "service not found",
            ErrorKind::MethodNotFound => "method not found",
            ErrorKind::SerializeFailed => "serialize failed",
            ErrorKind::DeserializeFailed => "deserialize failed",
            ErrorKind::SendFailed => "send failed",
            ErrorKind::RecvFailed => "recv failed",
            ErrorKind::BindFailed => "bind failed",
            ErrorKind::HttpHandshakeFailed => "http handshake failed",
            ErrorKind::InvalidAddress => "invalid address",
            ErrorKind::UnsupportedProtocol => "unsupported protocol",
            ErrorKind::NoAvailableServers => "no available servers",
            ErrorKind::Remote => "remote",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    /// The sentinel returned once a client is closed or shut down.
    #[must_use]
    pub fn shutdown() -> Self {
        Self::new(ErrorKind::Shutdown, "connection is shut down")
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.kind == ErrorKind::Shutdown
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.msg.is_empty() {
            f.write_str(self.kind.as_str())
        } else {
            write!(f, "{} [{}]", self.msg, self.kind.as_str())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_tags_message_with_kind() {
        let error = Error::new(
            ErrorKind::HandleTimeout,
            "rpc server: request handle timeout: except within 1s",
        );
        assert_eq!(
            error.to_string(),
            "rpc server: request handle timeout: except within 1s [handle timeout]"
        );

        let error = Error::new(ErrorKind::MethodNotFound, "rpc server: can't find method Mul");
        assert!(error.to_string().contains("can't find method Mul"));
        assert!(error.to_string().ends_with("[method not found]"));
    }

    #[test]
    fn test_display_bare_kind() {
        assert_eq!(Error::new(ErrorKind::Eof, "").to_string(), "eof");
        assert_eq!(
            Error::new(ErrorKind::UnsupportedProtocol, "").to_string(),
            "unsupported protocol"
        );
    }

    #[test]
    fn test_shutdown_sentinel_identity() {
        let sentinel = Error::shutdown();
        assert!(sentinel.is_shutdown());
        assert!(sentinel.to_string().contains("connection is shut down"));

        // a remote error that happens to carry the same text is still
        // distinguishable by kind
        let remote = Error::new(ErrorKind::Remote, "connection is shut down");
        assert!(!remote.is_shutdown());
        assert_ne!(remote, sentinel);
    }

    #[test]
    fn test_kind_is_copy_and_comparable() {
        let kind = ErrorKind::ConnectTimeout;
        let copied = kind;
        assert_eq!(kind, copied);
        assert_eq!(copied.as_str(), "connect timeout");
        assert_ne!(ErrorKind::SendFailed.as_str(), ErrorKind::RecvFailed.as_str());
    }
}
