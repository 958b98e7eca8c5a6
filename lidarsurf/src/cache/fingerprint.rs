use serde::{Deserialize, Serialize};
use siphasher::sip128::{Hasher128, SipHasher13};
use std::fmt;
use std::hash::Hasher;
use std::path::Path;

use crate::collect::source::InputStamp;

/// Identity of one engine run: input file version plus pipeline description
///
/// 128-bit SipHash rendered as 32 hex digits. The hasher runs with fixed
/// keys so fingerprints stay stable across processes and releases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of `input` at version `stamp` processed by `description`
    ///
    /// `description` is the canonical JSON of the pipeline, output filename
    /// left unbound.
    pub fn compute(input: &Path, stamp: &InputStamp, description: &str) -> Self {
        let mut hasher = SipHasher13::new_with_keys(0, 0);
        write_field(&mut hasher, input.to_string_lossy().as_bytes());
        write_field(&mut hasher, &stamp.modified_nanos.to_le_bytes());
        write_field(&mut hasher, &stamp.size.to_le_bytes());
        write_field(&mut hasher, description.as_bytes());
        Fingerprint(format!("{:032x}", hasher.finish128().as_u128()))
    }

    /// Digest of a byte string alone, used to group products by parameters
    pub fn digest(bytes: &[u8]) -> Self {
        let mut hasher = SipHasher13::new_with_keys(0, 0);
        write_field(&mut hasher, bytes);
        Fingerprint(format!("{:032x}", hasher.finish128().as_u128()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Length-prefixed so that field boundaries cannot shift between inputs
fn write_field(hasher: &mut SipHasher13, bytes: &[u8]) {
    hasher.write(&(bytes.len() as u64).to_le_bytes());
    hasher.write(bytes);
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
