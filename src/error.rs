//! The compiler's single error type.
//!
//! Every fatal condition funnels through [`Error`]'s `Display` impl, which
//! renders the exact one-line diagnostic contract demanded by the language:
//! `path:line:col: error: <message>` when a source position is known, or
//! `path: error: <message>` otherwise. `main` prints this and exits non-zero;
//! there is no recovery path anywhere in the pipeline.

use std::fmt;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub path: String,
    pub pos: Option<(u32, u32)>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(path: &str, line: u32, col: u32, message: impl Into<String>) -> Diagnostic {
        Diagnostic {
            path: path.to_owned(),
            pos: Some((line, col)),
            message: message.into(),
        }
    }

    pub fn without_pos(path: &str, message: impl Into<String>) -> Diagnostic {
        Diagnostic {
            path: path.to_owned(),
            pos: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pos {
            Some((line, col)) => write!(
                f,
                "{}:{}:{}: error: {}",
                self.path, line, col, self.message
            ),
            None => write!(f, "{}: error: {}", self.path, self.message),
        }
    }
}

#[derive(Debug)]
pub enum IoContext {
    ReadInput,
    WriteOutput,
    OpenTestDir,
}

#[derive(Debug)]
pub enum Error {
    Diagnostic(Diagnostic),
    Io(std::io::Error, IoContext, PathBuf),
    Tool {
        tool: &'static str,
        file: String,
    },
    Cli(String),
}

impl From<Diagnostic> for Error {
    fn from(d: Diagnostic) -> Error {
        Error::Diagnostic(d)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Diagnostic(d) => write!(f, "{}", d),
            Error::Io(err, context, path) => write!(
                f,
                "{}: error: {} file \"{}\" failed: {}",
                path.display(),
                match context {
                    IoContext::ReadInput => "reading input",
                    IoContext::WriteOutput => "writing output",
                    IoContext::OpenTestDir => "opening test directory",
                },
                path.display(),
                err
            ),
            Error::Tool { tool, file } => {
                write!(f, "{}: error: failed to {}", file, tool)
            }
            Error::Cli(message) => write!(f, "steelc: error: {}", message),
        }
    }
}

impl std::error::Error for Error {}
