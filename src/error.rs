use thiserror::Error;

/// Error kinds surfaced to callers of this crate.
///
/// `kind()` is what the out-of-scope HTTP layer maps to status codes
/// (missing attribute => 422, unknown endpoint => 404, everything else => 500).
#[derive(Debug, Error)]
pub enum Error {
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    #[error("malformed feed: {0}")]
    MalformedFeed(String),

    #[error("store schema is older than this build; migration is required")]
    SchemaUpgradeRequired,

    #[error("store schema version is newer than this build understands")]
    SchemaUnknown,

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("not found")]
    NotFound,

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    FetchFailed,
    MalformedFeed,
    SchemaUpgradeRequired,
    SchemaUnknown,
    InvalidQuery,
    NotFound,
    InternalInvariant,
    Other,
}

impl Error {
    /// The coarse kind the out-of-scope HTTP layer maps to a status code.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::FetchFailed(_) | Error::Network(_) => ErrorKind::FetchFailed,
            Error::MalformedFeed(_) | Error::Zip(_) | Error::Csv(_) => ErrorKind::MalformedFeed,
            Error::SchemaUpgradeRequired => ErrorKind::SchemaUpgradeRequired,
            Error::SchemaUnknown => ErrorKind::SchemaUnknown,
            Error::InvalidQuery(_) => ErrorKind::InvalidQuery,
            Error::NotFound => ErrorKind::NotFound,
            Error::InternalInvariant(_) => ErrorKind::InternalInvariant,
            Error::Io(_) | Error::Json(_) | Error::Database(_) | Error::Join(_) => {
                ErrorKind::Other
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_fetch_failed() {
        let err = Error::FetchFailed("timeout".into());
        assert_eq!(err.kind(), ErrorKind::FetchFailed);
        assert_eq!(err.to_string(), "fetch failed: timeout");
    }

    #[test]
    fn kind_maps_malformed_feed() {
        let err = Error::MalformedFeed("missing stop_id".into());
        assert_eq!(err.kind(), ErrorKind::MalformedFeed);
    }

    #[test]
    fn kind_maps_invalid_query() {
        let err = Error::InvalidQuery("realtime requires stop or route".into());
        assert_eq!(err.kind(), ErrorKind::InvalidQuery);
    }

    #[test]
    fn io_error_converts_and_maps_other() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Other);
    }
}
