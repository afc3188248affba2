//! MD5 verification of the embedded archive digests.

use openssl::hash::{Hasher, MessageDigest};

use crate::error::{Result, VmaError};
use crate::file_formats::MD5_LEN;

/// Verifies the MD5 digests embedded in the header and extent regions.
///
/// The digest field is itself part of the digested region, so verification
/// feeds the bytes before the field, sixteen zero bytes in its place, and
/// everything after it. With `skip` set every check succeeds; the callers
/// still consume the digest bytes for position bookkeeping.
pub struct IntegrityChecker {
    skip: bool,
}

impl IntegrityChecker {
    pub fn new(skip: bool) -> Self {
        Self { skip }
    }

    /// Digest `before || [0u8; 16] || after...` and compare with `stored`.
    pub fn verify(
        &self,
        region: &'static str,
        offset: u64,
        before: &[u8],
        after: &[&[u8]],
        stored: &[u8; MD5_LEN],
    ) -> Result<()> {
        if self.skip {
            return Ok(());
        }

        let computed = md5_with_zeroed_field(before, after).map_err(|err| VmaError::Io {
            offset,
            source: std::io::Error::new(std::io::ErrorKind::Other, err),
        })?;

        if computed != *stored {
            return Err(VmaError::Checksum {
                region,
                offset,
                stored: *stored,
                computed,
            });
        }
        Ok(())
    }
}

fn md5_with_zeroed_field(
    before: &[u8],
    after: &[&[u8]],
) -> std::result::Result<[u8; MD5_LEN], openssl::error::ErrorStack> {
    let mut hasher = Hasher::new(MessageDigest::md5())?;
    hasher.update(before)?;
    hasher.update(&[0u8; MD5_LEN])?;
    for part in after {
        hasher.update(part)?;
    }
    let digest = hasher.finish()?;

    let mut sum = [0u8; MD5_LEN];
    sum.copy_from_slice(&digest);
    Ok(sum)
}
