// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Classified errors.
//!
//! Demux and parse functions return a `Result<_, Error>` where the error
//! carries an [`ErrorKind`] classification, an optional message, and an
//! optional source error. Only the top-level driver maps kinds to process
//! exit codes; everything below propagates with `?`.

use std::fmt;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/0e00c430827e81d61e1e7164ef04ca21ccbfaa77/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors. See that link for
/// descriptions of each error.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
        };
        f.write_str(s)
    }
}

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<BoxedError>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            msg: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn msg(&self) -> Option<&str> {
        self.msg.as_deref()
    }

    #[must_use]
    pub fn with_msg(mut self, msg: String) -> Self {
        self.msg = Some(msg);
        self
    }

    #[must_use]
    pub fn with_source<E: Into<BoxedError>>(mut self, source: E) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Returns a value which displays `self` and all its causes, colon-separated.
    pub fn chain(&self) -> ErrorChain<'_> {
        ErrorChain(self)
    }
}

/// Displays an [`Error`] along with its full cause chain.
pub struct ErrorChain<'a>(&'a Error);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = std::error::Error::source(self.0);
        while let Some(s) = source {
            write!(f, ": {s}")?;
            source = s.source();
        }
        Ok(())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.msg {
            Some(msg) => write!(f, "{}: {}", self.kind, msg),
            None => fmt::Display::fmt(&self.kind, f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.chain(), f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            std::io::ErrorKind::InvalidInput => ErrorKind::InvalidArgument,
            std::io::ErrorKind::UnexpectedEof => ErrorKind::OutOfRange,
            _ => ErrorKind::Unknown,
        };
        Error::new(kind).with_source(e)
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T, E> {
    /// Annotates an error with the given kind.
    ///
    /// Example:
    /// ```
    /// use ccdemux_base::{ErrorKind, ResultExt};
    /// use std::io::Read;
    /// let mut buf = [0u8; 1];
    /// let r = std::io::Cursor::new("").read_exact(&mut buf[..]).err_kind(ErrorKind::Internal);
    /// assert_eq!(r.unwrap_err().kind(), ErrorKind::Internal);
    /// ```
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T, E> for Result<T, E>
where
    E: Into<BoxedError>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::new(k).with_source(e))
    }
}

/// Constructs an [`Error`], e.g. `err!(InvalidArgument, msg("bad stream id {id}"))`.
///
/// The message and source are optional; the source may be anything convertible
/// to a boxed error.
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind)
    };
    ($kind:ident, msg($($msg_args:tt)*) $(,)?) => {
        $crate::Error::new($crate::ErrorKind::$kind).with_msg(format!($($msg_args)*))
    };
    ($kind:ident, msg($($msg_args:tt)*), source($source:expr) $(,)?) => {
        $crate::Error::new($crate::ErrorKind::$kind)
            .with_msg(format!($($msg_args)*))
            .with_source($source)
    };
    ($kind:ident, source($source:expr) $(,)?) => {
        $crate::Error::new($crate::ErrorKind::$kind).with_source($source)
    };
}

/// Like [`err!`], but returns from the enclosing function.
#[macro_export]
macro_rules! bail {
    ($($t:tt)*) => {
        return Err($crate::err!($($t)*).into())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_and_without_msg() {
        let e = Error::new(ErrorKind::InvalidArgument);
        assert_eq!(e.to_string(), "Invalid argument");
        let e = err!(NotFound, msg("no such stream: {}", 3));
        assert_eq!(e.to_string(), "Not found: no such stream: 3");
    }

    #[test]
    fn chain_includes_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let e = err!(Unknown, msg("read failed"), source(io));
        assert_eq!(e.chain().to_string(), "Unknown: read failed: disk on fire");
    }

    #[test]
    fn io_error_kind_mapping() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let e: Error = io.into();
        assert_eq!(e.kind(), ErrorKind::OutOfRange);
    }
}
