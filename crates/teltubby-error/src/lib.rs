// Copyright 2026 The teltubby Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error taxonomy shared by every crate in the workspace.
//!
//! An [`Error`] carries a [`Code`] (the classification used for both
//! metrics labels and retry decisions), an optional `kind` tag matching the
//! vocabulary in the specification's error taxonomy (`quota_full`,
//! `dedup_conflict`, ...), and a chain of human context strings attached
//! via [`ResultExt::err_tip`] as the error propagates up the call stack.

use std::fmt;

/// Coarse classification of an error. Mirrors the taxonomy a gRPC-style
/// system would use; kept small and closed rather than open so callers can
/// match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Unauthorized,
    NotFound,
    InvalidArgument,
    AlreadyExists,
    ResourceExhausted,
    Unavailable,
    Cancelled,
    Internal,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A structured error with a classification code, a stable `kind` tag, and
/// a stack of context messages (most recent first is how they're pushed,
/// but [`Display`] renders oldest-first so the message reads top-down).
#[derive(Debug, Clone)]
pub struct Error {
    pub code: Code,
    pub kind: Option<&'static str>,
    messages: Vec<String>,
}

impl Error {
    #[must_use]
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            kind: None,
            messages: vec![message.into()],
        }
    }

    /// Attaches a stable machine-readable tag (e.g. `"quota_full"`) used as
    /// both the metrics label and the user-visible reason code. Keeping a
    /// single tag instead of a second enum means the log line and the
    /// metric can never drift apart.
    #[must_use]
    pub fn with_kind(mut self, kind: &'static str) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Appends a context message, read top-down as "higher level ... caused
    /// by ... caused by root cause".
    #[must_use]
    pub fn tip(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }

    /// Combines two errors that happened concurrently (e.g. two halves of a
    /// `join!`) into one, keeping the first error's code/kind and appending
    /// the second's messages.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.messages.push(format!("-- merged with --"));
        self.messages.extend(other.messages);
        self
    }

    #[must_use]
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn to_std_err(&self) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::Other, self.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.code)?;
        if let Some(kind) = self.kind {
            write!(f, "[{kind}]")?;
        }
        for message in &self.messages {
            write!(f, " {message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(Code::Internal, err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(Code::Internal, err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Error::new(Code::NotFound, err.to_string()),
            _ => Error::new(Code::Internal, err.to_string()),
        }
    }
}

/// Construct an [`Error`] with `format!`-style arguments, the workhorse of
/// every fallible path in this workspace.
#[macro_export]
macro_rules! make_err {
    ($code:expr, $($arg:tt)+) => {
        $crate::Error::new($code, format!($($arg)+))
    };
}

/// Shorthand for `make_err!(Code::InvalidArgument, ...)`, used at input
/// validation boundaries.
#[macro_export]
macro_rules! make_input_err {
    ($($arg:tt)+) => {
        $crate::Error::new($crate::Code::InvalidArgument, format!($($arg)+))
    };
}

/// Early-return with an [`Error`] if `cond` holds.
#[macro_export]
macro_rules! error_if {
    ($cond:expr, $($arg:tt)+) => {
        if $cond {
            return Err($crate::make_err!($crate::Code::InvalidArgument, $($arg)+));
        }
    };
}

/// Adds `.err_tip(|| "context")` to any `Result<T, E: Into<Error>>`, the
/// same ergonomics the teacher's `error` crate uses throughout its store
/// and scheduler layers.
pub trait ResultExt<T> {
    fn err_tip<F, M>(self, tip: F) -> Result<T, Error>
    where
        F: FnOnce() -> M,
        M: Into<String>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<Error>,
{
    fn err_tip<F, M>(self, tip: F) -> Result<T, Error>
    where
        F: FnOnce() -> M,
        M: Into<String>,
    {
        self.map_err(|e| e.into().tip(tip().into()))
    }
}

/// Same as [`ResultExt`] but for a bare [`Error`] that isn't wrapped in a
/// `Result` yet (used when merging two already-resolved errors).
pub trait ErrorExt {
    fn merge_opt(self, other: Option<Error>) -> Error;
}

impl ErrorExt for Error {
    fn merge_opt(self, other: Option<Error>) -> Error {
        match other {
            Some(other) => self.merge(other),
            None => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn err_tip_chains_messages_in_order() {
        let result: Result<(), Error> = Err(make_err!(Code::NotFound, "missing key"));
        let tipped = result.err_tip(|| "while looking up digest").unwrap_err();
        assert_eq!(tipped.code, Code::NotFound);
        assert_eq!(tipped.messages(), &["missing key", "while looking up digest"]);
    }

    #[test]
    fn with_kind_preserves_code() {
        let err = make_err!(Code::ResourceExhausted, "bucket full").with_kind("quota_full");
        assert_eq!(err.kind, Some("quota_full"));
        assert_eq!(err.code, Code::ResourceExhausted);
    }

    #[test]
    fn display_renders_code_kind_and_messages() {
        let err = make_err!(Code::Internal, "root cause")
            .with_kind("dedup_unavailable")
            .tip("while registering digest");
        let rendered = err.to_string();
        assert!(rendered.contains("Internal"));
        assert!(rendered.contains("dedup_unavailable"));
        assert!(rendered.contains("root cause"));
        assert!(rendered.contains("while registering digest"));
    }
}
