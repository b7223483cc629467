use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Remote file unavailable: {0}")]
    Unavailable(String),

    #[error("Geocoding error: {0}")]
    Geocode(String),
}

impl AppError {
    /// Whether retrying the same operation could succeed.
    ///
    /// Timeouts, refused or reset connections, interrupted bodies, socket
    /// I/O errors and server-side HTTP failures are transient. Builder,
    /// redirect and decode errors are not, nor are a missing remote file,
    /// bad content or configuration problems.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Http(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err.is_request()
                    || err.is_body()
                    || err
                        .status()
                        .map(|s| s.is_server_error() || s.as_u16() == 429)
                        .unwrap_or(false)
            }
            AppError::Io(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_are_transient() {
        let err = AppError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out",
        ));
        assert!(err.is_transient());
    }

    #[test]
    fn test_unavailable_is_permanent() {
        assert!(!AppError::Unavailable("sydney_airport-202301.csv".into()).is_transient());
        assert!(!AppError::Parse("bad".into()).is_transient());
    }
}
