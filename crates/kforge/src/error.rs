use std::fmt;

/// Which step of the pipeline produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Download,
    Extract,
    Patch,
    KernelConfig,
    Build,
    Stage,
    Io,
    RuntimeNotFound,
    FileNotFound,
    ContainerBuild,
    ContainerRun,
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Download => "download",
            ErrorKind::Extract => "extract",
            ErrorKind::Patch => "patch",
            ErrorKind::KernelConfig => "kernel-config",
            ErrorKind::Build => "build",
            ErrorKind::Stage => "stage",
            ErrorKind::Io => "io",
            ErrorKind::RuntimeNotFound => "runtime-not-found",
            ErrorKind::FileNotFound => "file-not-found",
            ErrorKind::ContainerBuild => "container-build",
            ErrorKind::ContainerRun => "container-run",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Prefix the message with context, keeping the kind.
    pub fn context<C: fmt::Display>(self, ctx: C) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{ctx}: {}", self.msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::new(ErrorKind::Config, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
