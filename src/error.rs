use std::fmt;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Config(String),
    OpenFailed(String),
    Closed,
    Duplicate(String),
    Clock,
    Internal(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Config(msg) => write!(f, "configuration error: {msg}"),
            Error::OpenFailed(msg) => write!(f, "open failed: {msg}"),
            Error::Closed => write!(f, "object has seen eof"),
            Error::Duplicate(name) => write!(f, "duplicate object name: {name}"),
            Error::Clock => write!(f, "wall clock unreadable"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
