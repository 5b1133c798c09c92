use thiserror::Error;

/// Failure status of a single grant operation.
///
/// The discriminants follow the hypervisor's `GNTST_*` status numbering so that status words can
/// be carried through batched calls unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum GrantError {
    #[error("general grant failure")]
    General,
    #[error("unknown or invalid domain")]
    BadDomain,
    #[error("unrecognised grant reference")]
    BadGrantRef,
    #[error("unrecognised or inappropriate mapping handle")]
    BadHandle,
    #[error("inappropriate virtual address")]
    BadVirtAddr,
    #[error("inappropriate device address")]
    BadDevAddr,
    #[error("out of space for device mappings")]
    NoDeviceSpace,
    #[error("permission denied")]
    PermissionDenied,
    #[error("bad page")]
    BadPage,
    #[error("copy arguments cross a page boundary")]
    BadCopyArg,
    #[error("page address exceeds the addressable range")]
    AddressTooBig,
    #[error("operation not done; try again")]
    Again,
}

impl GrantError {
    pub const fn status(self) -> i16 {
        match self {
            GrantError::General => -1,
            GrantError::BadDomain => -2,
            GrantError::BadGrantRef => -3,
            GrantError::BadHandle => -4,
            GrantError::BadVirtAddr => -5,
            GrantError::BadDevAddr => -6,
            GrantError::NoDeviceSpace => -7,
            GrantError::PermissionDenied => -8,
            GrantError::BadPage => -9,
            GrantError::BadCopyArg => -10,
            GrantError::AddressTooBig => -11,
            GrantError::Again => -12,
        }
    }

    /// Decode a negative status word. Returns `None` for success (0) and unknown codes.
    pub const fn from_status(status: i16) -> Option<Self> {
        Some(match status {
            -1 => GrantError::General,
            -2 => GrantError::BadDomain,
            -3 => GrantError::BadGrantRef,
            -4 => GrantError::BadHandle,
            -5 => GrantError::BadVirtAddr,
            -6 => GrantError::BadDevAddr,
            -7 => GrantError::NoDeviceSpace,
            -8 => GrantError::PermissionDenied,
            -9 => GrantError::BadPage,
            -10 => GrantError::BadCopyArg,
            -11 => GrantError::AddressTooBig,
            -12 => GrantError::Again,
            _ => return None,
        })
    }

    /// Whether the operation may succeed if retried unchanged.
    pub const fn is_transient(self) -> bool {
        matches!(self, GrantError::Again)
    }
}

pub type Result<T> = std::result::Result<T, GrantError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_decode_back() {
        for code in -12..=-1 {
            let err = GrantError::from_status(code).expect("known status");
            assert_eq!(err.status(), code);
        }
        assert_eq!(GrantError::from_status(0), None);
        assert_eq!(GrantError::from_status(-13), None);
    }

    #[test]
    fn only_eagain_is_transient() {
        assert!(GrantError::Again.is_transient());
        assert!(!GrantError::BadCopyArg.is_transient());
    }
}
