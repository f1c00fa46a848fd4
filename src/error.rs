use crate::archive::DecodeError;

/// Mount-time failure.
///
/// Operation-level failures use [`crate::filesystem::OpError`] instead;
/// this type only travels between the mount lifecycle and the console.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("archive is unreadable: {0}")]
    Source(std::io::Error),
    #[error("not an archive we can open: {0}")]
    ArchiveFormat(String),
    #[error("missing or wrong password")]
    Password,
    #[error("not enough free space on the temp drive")]
    DiskFull,
    #[error("unsupported archive extension `{0}`")]
    UnknownFormat(String),
    #[error("mount failed: {0}")]
    Mount(std::io::Error),
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// User errors are informational: logged locally, never eligible
    /// for remote bug reporting.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::Source(_)
                | Self::ArchiveFormat(_)
                | Self::Password
                | Self::DiskFull
                | Self::UnknownFormat(_)
                | Self::Mount(_)
        )
    }
    /// One-line hint printed under the error on the console.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::Source(_) => "check that the archive file still exists and the drive is connected",
            Self::ArchiveFormat(_) => "the archive may be truncated or not a real ZIP/7Z/RAR file",
            Self::Password => "re-run and enter the correct password when prompted",
            Self::DiskFull => "free some space on the temp drive and try again",
            Self::UnknownFormat(_) => "only .zip, .7z and .rar archives are supported",
            Self::Mount(_) => "the mount point may be in use; unmount it or pick another",
            Self::Internal(_) => "this is a bug, please report it",
        }
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        match value {
            DecodeError::Format(x) => Self::ArchiveFormat(x),
            DecodeError::Password => Self::Password,
            DecodeError::Io(x) => Self::Source(x),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classification() {
        assert!(Error::Password.is_user_error());
        assert!(Error::ArchiveFormat("no central directory".into()).is_user_error());
        assert!(!Error::Internal("invariant".into()).is_user_error());
    }
}
