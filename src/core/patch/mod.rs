//! Runtime code patching: signature search and trampoline writer.

pub mod signature;
pub mod trampoline;

pub use crate::core::patch::signature::{find_signature, Signature, SIGNATURE_LEN};
pub use crate::core::patch::trampoline::{patch_long_jump, patch_short_jump};

/// Failure modes of a revision attempt. Both are expected, recoverable
/// conditions: the caller simply tries the next candidate revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchError {
    /// The metadata stream yielded fewer bytes than required.
    ShortRead,
    /// A required code pattern was absent from the cartridge image.
    SignatureNotFound,
}

impl std::fmt::Display for PatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchError::ShortRead => write!(f, "metadata stream ended short"),
            PatchError::SignatureNotFound => write!(f, "driver signature not found in image"),
        }
    }
}

/// Result type for patch operations.
pub type PatchResult<T> = Result<T, PatchError>;
