//! Bounded Strings for Caller Supplied Text Buffers

use std::fmt;

use crate::error::PassThruError;

/// Size of the description buffers callers hand to the driver
pub const DESCRIPTION_CAPACITY: usize = 80;

/// String that fits a fixed-size, NUL-terminated caller buffer
///
/// Construction fails instead of truncating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedString<const N: usize> {
    text: String,
}

impl<const N: usize> BoundedString<N> {
    pub fn new(text: impl Into<String>) -> Result<Self, PassThruError> {
        let text = text.into();
        // one byte is reserved for the terminating NUL
        if text.len() >= N {
            return Err(PassThruError::Failed(format!(
                "text of {} bytes does not fit a {} byte buffer",
                text.len(),
                N
            )));
        }
        Ok(Self { text })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Copy into a caller buffer as a NUL-terminated string
    pub fn copy_to(&self, out: &mut [u8]) -> Result<(), PassThruError> {
        let bytes = self.text.as_bytes();
        if out.len() <= bytes.len() {
            return Err(PassThruError::Failed(format!(
                "output buffer of {} bytes too small",
                out.len()
            )));
        }
        out[..bytes.len()].copy_from_slice(bytes);
        out[bytes.len()] = 0;
        Ok(())
    }
}

impl<const N: usize> fmt::Display for BoundedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Description sized for the 80-byte J2534 buffers
pub type Description = BoundedString<DESCRIPTION_CAPACITY>;
