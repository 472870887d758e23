// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, io};

/// Raw kernel errno, kept cloneable so errors can be fanned out to listeners
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    pub fn from_io(err: &io::Error) -> Self {
        Errno(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({})", self.0)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        io::Error::from_raw_os_error(self.0).fmt(f)
    }
}

/// Coarse classification used to decide between retrying, falling back and failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The driver lacks something we need; not retried
    Protocol,
    /// EBUSY from the kernel; retried after a refresh interval
    TransientBusy,
    /// EINVAL from a legacy page flip; retried once as a full mode set
    CompatibilityFallback,
    /// Device revoked, typically by a VT switch
    Permission,
    /// Any other ioctl failure
    HardIo,
    /// Nothing to commit
    Empty,
    /// The impl thread is gone
    Terminated,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KmsError {
    #[error("{object} has no \"{prop}\" property")]
    MissingProperty { object: String, prop: &'static str },
    #[error("{op} failed: {errno}")]
    Ioctl { op: String, errno: Errno },
    #[error("{op}: permission denied")]
    PermissionDenied { op: String },
    #[error("{0}")]
    Failed(String),
    #[error("Empty update")]
    EmptyUpdate,
    #[error("KMS thread is no longer running")]
    Terminated,
}

impl KmsError {
    /// Wrap an ioctl error, keeping permission errors distinguishable
    pub fn ioctl(op: impl Into<String>, err: &io::Error) -> Self {
        let errno = Errno::from_io(err);
        match errno.0 {
            libc::EACCES | libc::EPERM => KmsError::PermissionDenied { op: op.into() },
            _ => KmsError::Ioctl {
                op: op.into(),
                errno,
            },
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        KmsError::Failed(message.into())
    }

    pub fn errno(&self) -> Option<i32> {
        match self {
            KmsError::Ioctl { errno, .. } => Some(errno.0),
            KmsError::PermissionDenied { .. } => Some(libc::EACCES),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            KmsError::MissingProperty { .. } => ErrorKind::Protocol,
            KmsError::Ioctl { errno, .. } => match errno.0 {
                libc::EBUSY => ErrorKind::TransientBusy,
                libc::EINVAL => ErrorKind::CompatibilityFallback,
                _ => ErrorKind::HardIo,
            },
            KmsError::PermissionDenied { .. } => ErrorKind::Permission,
            KmsError::Failed(_) => ErrorKind::HardIo,
            KmsError::EmptyUpdate => ErrorKind::Empty,
            KmsError::Terminated => ErrorKind::Terminated,
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        self.kind() == ErrorKind::Permission
    }
}

pub type KmsResult<T> = std::result::Result<T, KmsError>;
