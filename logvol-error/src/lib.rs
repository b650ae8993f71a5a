#![feature(error_generic_member_access)]
#![deny(missing_docs)]

//! Error handling for the LogVol engine.
//!
//! Every fallible operation in the workspace returns a [`LogVolResult`]. Errors carry a
//! [`Backtrace`] captured at construction time, and are usually built with the
//! [`logvol_err`] and [`logvol_bail`] macros.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;
use std::{env, fmt, io};

/// A convenient macro for creating a LogVol error.
#[macro_export]
macro_rules! logvol_err {
    (Context: $msg:literal, $err:expr) => {{
        $crate::__private::must_use(
            $crate::LogVolError::Context($msg.into(), Box::new($err))
        )
    }};
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {{
        use std::backtrace::Backtrace;
        $crate::__private::must_use(
            $crate::LogVolError::$variant(format!($fmt, $($arg),*).into(), Backtrace::capture())
        )
    }};
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::logvol_err!(InvalidArgument: $fmt, $($arg),*)
    };
}

/// A convenient macro for returning a LogVol error.
#[macro_export]
macro_rules! logvol_bail {
    ($($tt:tt)+) => {
        return Err($crate::logvol_err!($($tt)+))
    };
}

/// A convenient macro for panicking with a LogVol error.
#[macro_export]
macro_rules! logvol_panic {
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::logvol_panic!($crate::logvol_err!($variant: $fmt, $($arg),*))
    };
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::logvol_panic!($crate::logvol_err!($fmt, $($arg),*))
    };
    ($err:expr) => {{
        #[allow(clippy::panic)]
        {
            let err: $crate::LogVolError = $err;
            panic!("{}", err)
        }
    }};
}

/// A string that can be used as an error message.
#[derive(Debug)]
pub struct ErrString(Cow<'static, str>);

#[allow(clippy::fallible_impl_from)]
impl<T> From<T> for ErrString
where
    T: Into<Cow<'static, str>>,
{
    fn from(msg: T) -> Self {
        if env::var("LOGVOL_PANIC_ON_ERR").as_deref().unwrap_or("") == "1" {
            panic!("{}\nBacktrace:\n{}", msg.into(), Backtrace::capture());
        } else {
            Self(msg.into())
        }
    }
}

impl AsRef<str> for ErrString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for ErrString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for ErrString {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The top-level error type for LogVol.
#[derive(thiserror::Error)]
#[non_exhaustive]
pub enum LogVolError {
    /// Staging a write would exceed the configured buffer quota.
    #[error("{0}\nBacktrace:\n{1}")]
    OutOfBuffer(ErrString, Backtrace),
    /// A staging or read buffer could not be allocated.
    #[error("{0}\nBacktrace:\n{1}")]
    OutOfMemory(ErrString, Backtrace),
    /// A collective read or write against the underlying storage failed.
    #[error("{0}\nBacktrace:\n{1}")]
    CollectiveIO(ErrString, Backtrace),
    /// The underlying storage could not report a file offset for a new blob.
    #[error("{0}\nBacktrace:\n{1}")]
    MetadataAllocationFailed(ErrString, Backtrace),
    /// The selection shape is not supported, or lies outside the dataset.
    #[error("{0}\nBacktrace:\n{1}")]
    InvalidSelection(ErrString, Backtrace),
    /// A persisted metadata blob or summary record failed validation.
    #[error("{0}\nBacktrace:\n{1}")]
    IndexCorrupt(ErrString, Backtrace),
    /// An invalid argument was provided.
    #[error("{0}\nBacktrace:\n{1}")]
    InvalidArgument(ErrString, Backtrace),
    /// A named object does not exist.
    #[error("{0}\nBacktrace:\n{1}")]
    NotFound(ErrString, Backtrace),
    /// The same physical file is already open in this process.
    #[error("{0}\nBacktrace:\n{1}")]
    AlreadyOpen(ErrString, Backtrace),
    /// A wrapper for other errors, carrying additional context.
    #[error("{0}: {1}")]
    Context(ErrString, #[source] Box<LogVolError>),
    /// A wrapper for IO errors.
    #[error("IO error: {0}\nBacktrace:\n{1}")]
    IOError(#[from] io::Error, Backtrace),
    /// A wrapper for JSON (de)serialization errors.
    #[cfg(feature = "serde")]
    #[error("JSON error: {0}\nBacktrace:\n{1}")]
    JsonError(#[from] serde_json::Error, Backtrace),
}

impl LogVolError {
    /// Adds additional context to an error.
    pub fn with_context<T: Into<ErrString>>(self, msg: T) -> Self {
        LogVolError::Context(msg.into(), Box::new(self))
    }

    /// The negative status code reported to the surrounding connector layer.
    pub fn status(&self) -> i32 {
        match self {
            LogVolError::OutOfBuffer(..) => -2,
            LogVolError::OutOfMemory(..) => -3,
            LogVolError::CollectiveIO(..) => -4,
            LogVolError::MetadataAllocationFailed(..) => -5,
            LogVolError::InvalidSelection(..) => -6,
            LogVolError::IndexCorrupt(..) => -7,
            LogVolError::NotFound(..) => -8,
            LogVolError::AlreadyOpen(..) => -9,
            LogVolError::Context(_, inner) => inner.status(),
            _ => -1,
        }
    }

    /// The innermost error, looking through any [`LogVolError::Context`] wrappers.
    pub fn root(&self) -> &LogVolError {
        match self {
            LogVolError::Context(_, inner) => inner.root(),
            other => other,
        }
    }
}

impl Debug for LogVolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// A type alias for Results that return LogVol errors.
pub type LogVolResult<T> = Result<T, LogVolError>;

/// A trait for unwrapping a LogVol result.
pub trait LogVolUnwrap {
    /// The type of the value being unwrapped.
    type Output;

    /// Returns the value of the result if it is Ok, otherwise panics with the error.
    /// Should be called only in contexts where the error condition represents a bug.
    fn logvol_unwrap(self) -> Self::Output;
}

impl<T, E> LogVolUnwrap for Result<T, E>
where
    E: Into<LogVolError>,
{
    type Output = T;

    #[inline(always)]
    fn logvol_unwrap(self) -> Self::Output {
        self.map_err(|err| err.into())
            .unwrap_or_else(|err| logvol_panic!(err))
    }
}

/// A trait for expecting a LogVol result or option.
pub trait LogVolExpect {
    /// The type of the value being expected.
    type Output;

    /// Returns the value of the result if it is Ok, otherwise panics with the error.
    /// Should be called only in contexts where the error condition represents a bug.
    fn logvol_expect(self, msg: &str) -> Self::Output;
}

impl<T, E> LogVolExpect for Result<T, E>
where
    E: Into<LogVolError>,
{
    type Output = T;

    #[inline(always)]
    fn logvol_expect(self, msg: &str) -> Self::Output {
        self.map_err(|err| err.into())
            .unwrap_or_else(|e| logvol_panic!(e.with_context(msg.to_string())))
    }
}

impl<T> LogVolExpect for Option<T> {
    type Output = T;

    #[inline(always)]
    fn logvol_expect(self, msg: &str) -> Self::Output {
        self.unwrap_or_else(|| {
            let err = LogVolError::InvalidArgument(msg.to_string().into(), Backtrace::capture());
            logvol_panic!(err)
        })
    }
}

#[doc(hidden)]
pub mod __private {
    #[doc(hidden)]
    #[inline]
    #[must_use]
    pub const fn must_use(error: crate::LogVolError) -> crate::LogVolError {
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bail_out_of_buffer(requested: u64) -> LogVolResult<()> {
        logvol_bail!(OutOfBuffer: "cannot stage {} bytes", requested)
    }

    #[test]
    fn status_codes_are_negative() {
        let err = bail_out_of_buffer(16).unwrap_err();
        assert!(matches!(err, LogVolError::OutOfBuffer(..)));
        assert_eq!(err.status(), -2);
        assert!(logvol_err!("bad").status() < 0);
    }

    #[test]
    fn context_preserves_kind() {
        let err = logvol_err!(IndexCorrupt: "bad stride").with_context("refreshing index");
        assert_eq!(err.status(), -7);
        assert!(matches!(err.root(), LogVolError::IndexCorrupt(..)));
        assert!(err.to_string().starts_with("refreshing index: bad stride"));
    }

    #[test]
    fn io_errors_convert() {
        let err: LogVolError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(err, LogVolError::IOError(..)));
        assert_eq!(err.status(), -1);
    }

    #[test]
    #[should_panic(expected = "staging chunk")]
    fn expect_carries_message() {
        bail_out_of_buffer(8).logvol_expect("staging chunk");
    }
}
