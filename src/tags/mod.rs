//! Metadata tag codec
//!
//! A tag set is a small key-value block embedded in a finished container.
//! On the wire it is an `MTAG` envelope: magic, version, flags, then either
//! the JSON-serialized map (plaintext) or an AEAD-sealed blob
//! ([`crypto`]). Container-specific placement (Matroska Tags element, MP4
//! `free` box, FLV script tag) lives with each container implementation;
//! this module owns the envelope itself.

pub mod crypto;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{EngineError, EngineResult};

/// Envelope magic, kept at offset 0 so encrypted blocks are detectable
/// with a four-byte read.
pub const MAGIC: &[u8; 4] = b"MTAG";

const VERSION: u8 = 1;
const FLAG_ENCRYPTED: u8 = 0x01;

/// An ordered tag-name → value mapping. `BTreeMap` keeps plaintext
/// serialization deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merges `other` into `self`; existing keys are kept.
    pub fn merge_missing(&mut self, other: &TagSet) {
        for (k, v) in other.iter() {
            self.0.entry(k.to_string()).or_insert_with(|| v.to_string());
        }
    }
}

impl FromIterator<(String, String)> for TagSet {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        TagSet(iter.into_iter().collect())
    }
}

/// Serializes a tag set into an envelope, sealing it when a password is
/// given. Sealed envelopes are nondeterministic (random salt and nonce)
/// but decode identically.
pub fn encode(tags: &TagSet, password: Option<&str>) -> EngineResult<Vec<u8>> {
    let json = serde_json::to_vec(tags)?;
    let mut out = Vec::with_capacity(json.len() + 6);
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    match password {
        None => {
            out.push(0);
            out.extend_from_slice(&json);
        }
        Some(pw) => {
            out.push(FLAG_ENCRYPTED);
            out.extend_from_slice(&crypto::seal(&json, pw)?);
        }
    }
    Ok(out)
}

/// Decodes an envelope back into a tag set.
///
/// An encrypted envelope with no or the wrong password is `AuthError`;
/// structural damage (bad magic, truncation, unparseable map) is
/// `FormatError`. A password supplied for a plaintext envelope is ignored.
pub fn decode(data: &[u8], password: Option<&str>) -> EngineResult<TagSet> {
    if data.len() < 6 || &data[0..4] != MAGIC {
        return Err(EngineError::format("not a tag envelope"));
    }
    if data[4] != VERSION {
        return Err(EngineError::format(format!(
            "unsupported tag envelope version {}",
            data[4]
        )));
    }
    let encrypted = data[5] & FLAG_ENCRYPTED != 0;
    let payload = &data[6..];

    let json = if encrypted {
        let pw = password
            .ok_or_else(|| EngineError::auth("tag block is encrypted and no password given"))?;
        crypto::open(payload, pw)?
    } else {
        payload.to_vec()
    };

    serde_json::from_slice(&json)
        .map_err(|e| EngineError::format(format!("invalid tag block: {e}")))
}

/// True when `data` looks like a tag envelope.
pub fn is_envelope(data: &[u8]) -> bool {
    data.len() >= 6 && &data[0..4] == MAGIC
}

/// True when `data` is an envelope that needs a password to decode.
pub fn is_encrypted(data: &[u8]) -> bool {
    is_envelope(data) && data[5] & FLAG_ENCRYPTED != 0
}
