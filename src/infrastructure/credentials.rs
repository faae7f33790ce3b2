//! Credential decryption seam.
//!
//! The actual cipher is a deployment collaborator (KMS, vault, whatever the
//! hosting stack provides). The engine only requires something implementing
//! `ApiKeyCipher`; this module ships the pass-through used by local runs and
//! tests, where stored "encrypted" blobs are the keys themselves.

use crate::domain::ports::ApiKeyCipher;
use anyhow::{Result, bail};

pub struct PassthroughCipher;

impl ApiKeyCipher for PassthroughCipher {
    fn decrypt(&self, encrypted: &str) -> Result<String> {
        if encrypted.is_empty() {
            bail!("encrypted credential blob is empty");
        }
        Ok(encrypted.to_string())
    }
}
