use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PmError {
    #[error("query cannot be empty")]
    EmptyQuery,

    #[error(".pm/ already exists in {0}")]
    AlreadyInitialized(Utf8PathBuf),

    #[error("no .pm/ directory found (run 'pm init' first)")]
    RootNotFound,

    #[error("E-utilities request failed: {0}")]
    EutilsHttp(String),

    #[error("E-utilities returned status {status}: {message}")]
    EutilsStatus { status: u16, message: String },

    #[error("malformed E-utilities response: {0}")]
    EutilsDecode(String),

    #[error("Citation Exporter request failed: {0}")]
    CiteHttp(String),

    #[error("Citation Exporter returned status {status}: {message}")]
    CiteStatus { status: u16, message: String },

    #[error("ID Converter request failed: {0}")]
    IdConvHttp(String),

    #[error("ID Converter returned status {status}: {message}")]
    IdConvStatus { status: u16, message: String },

    #[error("PMC OA request failed: {0}")]
    PmcHttp(String),

    #[error("Unpaywall request failed: {0}")]
    UnpaywallHttp(String),

    #[error("download request failed: {0}")]
    DownloadHttp(String),

    #[error("audit log write failed: {0}")]
    Audit(String),

    #[error("invalid year filter '{0}' (expected YYYY, YYYY-YYYY, YYYY-, or -YYYY)")]
    InvalidYearFilter(String),

    #[error("file does not exist: {0}")]
    InputNotFound(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
