use std::fmt;

/// Error kind, classifying errors for logging and exit-code purposes.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/0e00c430827e81d61e1e7164ef04ca21ccbfaa77/include/grpcpp/impl/codegen/status_code_enum.h),
/// a nice general-purpose classification of errors.
#[derive(Copy, Clone, Eq, PartialEq, Debug, derive_more::Display)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    #[display("cancelled")] Cancelled,
    #[display("unknown")] Unknown,
    #[display("invalid argument")] InvalidArgument,
    #[display("deadline exceeded")] DeadlineExceeded,
    #[display("not found")] NotFound,
    #[display("already exists")] AlreadyExists,
    #[display("resource exhausted")] ResourceExhausted,
    #[display("failed precondition")] FailedPrecondition,
    #[display("aborted")] Aborted,
    #[display("unimplemented")] Unimplemented,
    #[display("internal")] Internal,
    #[display("unavailable")] Unavailable,
}

/// A boxed, chainable error carrying an [`ErrorKind`].
///
/// Unlike the historical `failure`-based version of this type, the source
/// chain is just `std::error::Error::source`; `Error::chain` renders it for
/// logging the way `anyhow::Error` does.
#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("{kind}: {source}")]
pub struct Error {
    kind: ErrorKind,
    #[error(source)]
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl Error {
    pub fn new<E>(kind: ErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Error {
            kind,
            source: source.into(),
        }
    }

    pub fn msg(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error::new(kind, StringError(msg.into()))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Renders this error and every `source()` in its chain, one per line.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.0.kind, self.0.source)?;
        let mut cause = std::error::Error::source(&*self.0.source);
        while let Some(c) = cause {
            write!(f, "\ncaused by: {c}")?;
            cause = c.source();
        }
        Ok(())
    }
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
struct StringError(String);

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error::msg(kind, kind.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
                ErrorKind::InvalidArgument
            }
            std::io::ErrorKind::TimedOut => ErrorKind::DeadlineExceeded,
            _ => ErrorKind::Internal,
        };
        Error::new(kind, e)
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T, E> {
    /// Annotates an error with the given kind.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T, E> for Result<T, E>
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::new(k, e))
    }
}

/// Like `anyhow::bail!`, but the first argument specifies a type as an `ErrorKind`.
#[macro_export]
macro_rules! bail_t {
    ($t:ident, $($arg:tt)+) => {
        return Err($crate::Error::msg($crate::ErrorKind::$t, format!($($arg)+)));
    };
}

/// Like `anyhow::anyhow!`, but the first argument specifies a type as an `ErrorKind`.
#[macro_export]
macro_rules! format_err_t {
    ($t:ident, $($arg:tt)+) => {
        $crate::Error::msg($crate::ErrorKind::$t, format!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bail_t_sets_kind() {
        fn g() -> Result<(), Error> {
            bail_t!(NotFound, "unknown user: {}", "slamb");
        }
        let e = g().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert_eq!(e.to_string(), "not found: unknown user: slamb");
    }

    #[test]
    fn chain_renders_causes() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let e: Error = io.into();
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert!(e.chain().to_string().starts_with("not found:"));
    }
}
