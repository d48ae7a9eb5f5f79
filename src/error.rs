use nix::errno::Errno;
use std::fmt;

/// Error vocabulary carried across the core.
///
/// The kinds are errno-shaped because most of them originate at kernel or
/// socket boundaries and the dispositions follow the errno conventions the
/// rest of the daemon logs and matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Upstream daemon absent (ENOPROTOOPT). Surface `disabled`, stay asleep.
    NotRunning,
    /// Transient, e.g. no fix yet (EAGAIN). Surface `listening`.
    TryAgain,
    /// Malformed reply (EPROTO). Treat as disconnect.
    Protocol,
    /// Ring overrun for a reader (ENODATA). Caller retries next tick.
    NoData,
    /// Freshness violation (ESTALE). Caller may retry next tick.
    Stale,
    /// Source removed (EOWNERDEAD). Caller unsubscribes.
    Dead,
    /// Referenced clock or instance no longer exists (ENOENT).
    NoEntry,
    /// Operation interrupted (EINTR).
    Interrupted,
    /// Unrecoverable local condition. Task exits; engine surfaces `faulty`.
    Fatal,
}

impl ErrorKind {
    pub fn from_errno(e: Errno) -> Self {
        match e {
            Errno::ENOPROTOOPT => ErrorKind::NotRunning,
            Errno::EAGAIN => ErrorKind::TryAgain,
            Errno::EPROTO => ErrorKind::Protocol,
            Errno::ENODATA => ErrorKind::NoData,
            Errno::ESTALE => ErrorKind::Stale,
            Errno::EOWNERDEAD => ErrorKind::Dead,
            Errno::ENOENT => ErrorKind::NoEntry,
            Errno::EINTR => ErrorKind::Interrupted,
            _ => ErrorKind::Fatal,
        }
    }

    pub fn to_errno(self) -> Errno {
        match self {
            ErrorKind::NotRunning => Errno::ENOPROTOOPT,
            ErrorKind::TryAgain => Errno::EAGAIN,
            ErrorKind::Protocol => Errno::EPROTO,
            ErrorKind::NoData => Errno::ENODATA,
            ErrorKind::Stale => Errno::ESTALE,
            ErrorKind::Dead => Errno::EOWNERDEAD,
            ErrorKind::NoEntry => Errno::ENOENT,
            ErrorKind::Interrupted => Errno::EINTR,
            ErrorKind::Fatal => Errno::EIO,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotRunning => "not-running",
            ErrorKind::TryAgain => "try-again",
            ErrorKind::Protocol => "protocol",
            ErrorKind::NoData => "no-data",
            ErrorKind::Stale => "stale",
            ErrorKind::Dead => "dead",
            ErrorKind::NoEntry => "no-entry",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct SyncError {
    pub kind: ErrorKind,
    detail: Option<String>,
}

impl SyncError {
    pub fn new(kind: ErrorKind) -> Self {
        SyncError { kind, detail: None }
    }

    pub fn with(kind: ErrorKind, detail: impl Into<String>) -> Self {
        SyncError {
            kind,
            detail: Some(detail.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(d) => write!(f, "{}: {}", self.kind, d),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<Errno> for SyncError {
    fn from(e: Errno) -> Self {
        SyncError::new(ErrorKind::from_errno(e))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.raw_os_error() {
            Some(code) => ErrorKind::from_errno(Errno::from_i32(code)),
            None => ErrorKind::Fatal,
        };
        SyncError::with(kind, e.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_round_trip() {
        let kinds = [
            ErrorKind::NotRunning,
            ErrorKind::TryAgain,
            ErrorKind::Protocol,
            ErrorKind::NoData,
            ErrorKind::Stale,
            ErrorKind::Dead,
            ErrorKind::NoEntry,
            ErrorKind::Interrupted,
        ];
        for k in kinds {
            assert_eq!(ErrorKind::from_errno(k.to_errno()), k);
        }
    }

    #[test]
    fn test_unknown_errno_maps_to_fatal() {
        assert_eq!(ErrorKind::from_errno(Errno::EINVAL), ErrorKind::Fatal);
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::from_raw_os_error(libc::EAGAIN);
        let e: SyncError = io.into();
        assert_eq!(e.kind(), ErrorKind::TryAgain);
    }
}
