use thiserror::Error;

/// Error kinds surfaced by the public API and mapped onto HTTP statuses by
/// the server.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("already done")]
    AlreadyDone,
    #[error("already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("not ready")]
    NotReady,
    #[error("not supported")]
    NotSupported,
    #[error("busy")]
    Busy,
    #[error("bad state")]
    BadState,
    #[error("timed out")]
    Timeout,
    #[error("stalled")]
    Stalled,
    #[error("authentication failed")]
    AuthenticationFailed,
    /// Raw error code returned by the codec library.
    #[error("codec error {0}: {}", crate::ffi::err_str(*.0))]
    Codec(i32),
    #[error("unknown")]
    Unknown,
}

impl Error {
    /// HTTP status the server replies with when a stream request fails.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::AuthenticationFailed => 401,
            Error::NotReady => 403,
            Error::NotFound => 404,
            _ => 400,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(Error::AuthenticationFailed.http_status(), 401);
        assert_eq!(Error::NotReady.http_status(), 403);
        assert_eq!(Error::NotFound.http_status(), 404);
        assert_eq!(Error::AlreadyExists.http_status(), 400);
        assert_eq!(Error::Codec(-22).http_status(), 400);
    }
}
