use crate::archive::DecodeError;

/// Status returned to the kernel bridge by dispatcher operations.
///
/// Only used to manage statuses in a centralized way; the adapter
/// converts to [`fuse3::Errno`] immediately at the bridge boundary and
/// nothing is allowed to unwind past it.
#[derive(thiserror::Error, Debug)]
pub enum OpError {
    #[error("file exists")]
    FileExists,
    #[error("path not found")]
    PathNotFound,
    #[error("not a dir")]
    NotDirectory,
    #[error("not a readable file")]
    IsDirectory,
    #[error("access denied")]
    AccessDenied,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("not enough space on the temp drive")]
    DiskFull,
    #[error("not ready")]
    NotReady,
    #[error("unimplemented")]
    Unimplemented,
    #[error("path too long")]
    PathTooLong,
    #[error("missed handle")]
    HandleNotFound,
    #[error("underlaying io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DecodeError> for OpError {
    fn from(value: DecodeError) -> Self {
        match value {
            // entry needs a password nobody supplied at mount
            DecodeError::Password => Self::AccessDenied,
            DecodeError::Io(x) => Self::Io(x),
            DecodeError::Format(x) => {
                log::error!("archive broke after mount: {}", x);
                Self::NotReady
            }
        }
    }
}

impl From<OpError> for fuse3::Errno {
    fn from(value: OpError) -> Self {
        match value {
            OpError::FileExists => libc::EEXIST,
            OpError::PathNotFound => libc::ENOENT,
            OpError::NotDirectory => libc::ENOTDIR,
            OpError::IsDirectory => libc::EISDIR,
            OpError::AccessDenied => libc::EACCES,
            OpError::InvalidParameter => libc::EINVAL,
            OpError::DiskFull => libc::ENOSPC,
            OpError::NotReady => libc::EAGAIN,
            OpError::Unimplemented => libc::ENOSYS,
            OpError::HandleNotFound => libc::EBADF,
            OpError::PathTooLong => {
                // generic failure on purpose, the length limit is logged
                // by the validator
                libc::EIO
            }
            OpError::Io(x) => {
                log::warn!("io error behind a handle: {}", x);
                x.raw_os_error().unwrap_or(libc::EIO)
            }
        }
        .into()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(fuse3::Errno::from(OpError::AccessDenied), libc::EACCES.into());
        assert_eq!(fuse3::Errno::from(OpError::PathNotFound), libc::ENOENT.into());
        assert_eq!(fuse3::Errno::from(OpError::FileExists), libc::EEXIST.into());
        assert_eq!(fuse3::Errno::from(OpError::DiskFull), libc::ENOSPC.into());
    }
}
