//! Content hashing and identity types.
//!
//! Source files and artifacts are identified by XXH3-128 digests; module
//! contexts and translation units by XXH3-64 digests of their defining text.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::DaemonError;

/// A 128-bit content hash. Serialized as 32 lowercase hex digits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 16]);

impl ContentHash {
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(xxhash_rust::xxh3::xxh3_128(data).to_le_bytes())
    }

    /// Hash an ordered sequence of parts, length-prefixing each so that
    /// `["ab", "c"]` and `["a", "bc"]` differ.
    pub fn from_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = xxhash_rust::xxh3::Xxh3::new();
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(hasher.digest128().to_le_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl FromStr for ContentHash {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.is_ascii() {
            return Err(DaemonError::ParseError(format!("bad content hash '{s}'")));
        }
        let mut out = [0u8; 16];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|e| DaemonError::ParseError(format!("bad content hash '{s}': {e}")))?;
        }
        Ok(Self(out))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Hash of the compile flags that make module artifacts incompatible with
/// each other. Two compilations of one module name with different contexts
/// are different modules.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct ContextHash(pub u64);

impl ContextHash {
    pub fn of_flags<S: AsRef<str>>(flags: &[S]) -> Self {
        let joined = flags
            .iter()
            .map(|f| f.as_ref())
            .collect::<Vec<_>>()
            .join("\0");
        Self(xxhash_rust::xxh3::xxh3_64(joined.as_bytes()))
    }
}

impl fmt::Display for ContextHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for ContextHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextHash({:016x})", self.0)
    }
}

/// Stable identity of a translation unit: its working directory and compile
/// command. Re-registering the same compilation yields the same id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TuId(pub u64);

impl TuId {
    pub fn of(working_directory: &std::path::Path, command: &[String]) -> Self {
        let dir = working_directory.to_string_lossy();
        let mut parts: Vec<&[u8]> = vec![dir.as_bytes()];
        parts.extend(command.iter().map(|a| a.as_bytes()));
        let digest = ContentHash::from_parts(parts);
        let mut low = [0u8; 8];
        low.copy_from_slice(&digest.as_bytes()[..8]);
        Self(u64::from_le_bytes(low))
    }
}

impl fmt::Display for TuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tu-{:016x}", self.0)
    }
}

impl fmt::Debug for TuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TuId({:016x})", self.0)
    }
}
