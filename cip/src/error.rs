use {
    std::io::{self, ErrorKind},
    thiserror::Error,
};

/// Failures of a cipher stream.
///
/// Every error is permanent for the stream it occurred on: nothing is retried
/// and partial output is not rolled back.
#[derive(Debug, Error)]
pub enum CipError {
    #[error("passphrase is not configured (set `{0}`)")]
    ConfigMissing(String),
    /// Read-write and append modes. Appending would put a second IV and
    /// keystream after an existing container, which no reader can decrypt.
    #[error("cipher streams are either read-only or write-only without append, got mode {0:?}")]
    InvalidMode(String),
    #[error("failed to open the underlying stream")]
    InnerOpenFailed(#[source] io::Error),
    #[error("failed to read from the underlying stream")]
    InnerReadFailed(#[source] io::Error),
    #[error("failed to write to the underlying stream")]
    InnerWriteFailed(#[source] io::Error),
    #[error("failed to close the underlying stream")]
    InnerCloseFailed(#[source] io::Error),
    #[error("not an encrypted stream: only {0} of 16 header bytes present")]
    TruncatedHeader(usize),
    #[error("failed to generate IV: {0}")]
    IvError(String),
    #[error("key derivation failed: {0}")]
    KeyDerivationError(String),
    #[error("cipher failure: {0}")]
    CipherError(String),
    #[error("cipher streams are not seekable")]
    NotSeekable,
}

impl CipError {
    /// Finds the cipher error carried by an `io::Error` returned from a
    /// cipher stream.
    #[must_use]
    #[inline]
    pub fn of(err: &io::Error) -> Option<&Self> {
        err.get_ref()?.downcast_ref()
    }

    /// The `io::ErrorKind` this error is reported with.
    ///
    /// Errors of the underlying stream keep their own kind.
    #[must_use]
    #[inline]
    pub fn io_kind(&self) -> ErrorKind {
        match self {
            Self::ConfigMissing(_) => ErrorKind::PermissionDenied,
            Self::InvalidMode(_) => ErrorKind::InvalidInput,
            Self::InnerOpenFailed(err)
            | Self::InnerReadFailed(err)
            | Self::InnerWriteFailed(err)
            | Self::InnerCloseFailed(err) => err.kind(),
            Self::TruncatedHeader(_) => ErrorKind::InvalidData,
            Self::IvError(_) | Self::KeyDerivationError(_) | Self::CipherError(_) => {
                ErrorKind::Other
            }
            Self::NotSeekable => ErrorKind::NotSeekable,
        }
    }
}

impl From<CipError> for io::Error {
    #[inline]
    fn from(err: CipError) -> Self {
        Self::new(err.io_kind(), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_conversion_keeps_kind_and_error() {
        let inner = io::Error::new(ErrorKind::NotFound, "no such file");
        let err = io::Error::from(CipError::InnerOpenFailed(inner));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(matches!(CipError::of(&err), Some(CipError::InnerOpenFailed(_))));

        let err = io::Error::from(CipError::NotSeekable);
        assert_eq!(err.kind(), ErrorKind::NotSeekable);

        let err = io::Error::from(CipError::ConfigMissing("HTS_CIP_KEY".into()));
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(err.to_string().contains("HTS_CIP_KEY"));

        assert!(CipError::of(&io::Error::other("plain")).is_none());
    }
}
