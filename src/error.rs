use miette::Diagnostic;
use thiserror::Error;

/// A `Result` typedef to use with the [`CacheError`] type
pub type Result<T> = std::result::Result<T, CacheError>;

/// A generic “error” for layered byte caches
#[derive(Error, Diagnostic, Debug)]
pub enum CacheError {
    /// A general error used as a catch all for other errors via anyhow
    #[error(transparent)]
    #[diagnostic(code(webcache::general))]
    General(#[from] anyhow::Error),
    /// Error from the filesystem
    #[error(transparent)]
    #[diagnostic(code(webcache::io))]
    Io(#[from] std::io::Error),
    /// There was an error parsing the URL
    #[error(transparent)]
    #[diagnostic(code(webcache::invalid_url))]
    InvalidUrl(#[from] url::ParseError),
    /// Error from the HTTP client
    #[error(transparent)]
    #[diagnostic(code(webcache::client))]
    Client(#[from] reqwest::Error),
    /// The sidecar metadata record could not be decoded
    #[error("invalid sidecar metadata at {path}")]
    #[diagnostic(code(webcache::sidecar))]
    Sidecar {
        /// Path of the payload file the sidecar belongs to
        path: String,
        /// The underlying JSON error
        #[source]
        source: serde_json::Error,
    },
    /// The requested byte range cannot be served from the available bytes
    #[error("requested range at offset {offset} (length {length:?}) is not available")]
    #[diagnostic(code(webcache::range))]
    RangeInvalid {
        /// Byte offset within the complete resource
        offset: u64,
        /// Requested segment length, if one was given
        length: Option<u64>,
    },
    /// The origin answered with a status the cache cannot serve from
    #[error("{url} responded {status}: {message}")]
    #[diagnostic(code(webcache::transport))]
    Transport {
        /// The HTTP status code
        status: u16,
        /// A human readable description of the failure
        message: String,
        /// The URL the request was issued for
        url: String,
    },
}
