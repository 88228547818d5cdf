// Copyright 2024 Guanhao Yin <sopium@mysterious.site>

// This file is part of wgdash.

// wgdash is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// wgdash is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with wgdash.  If not, see <https://www.gnu.org/licenses/>.

use crate::tools::Tools;

/// Whether `key` looks like a base64 encoded X25519 key.
pub fn is_valid_key(key: &str) -> bool {
    key.len() == 44
        && base64::decode(key)
            .map(|k| k.len() == 32)
            .unwrap_or(false)
}

/// Key material of a tunnel. The public key is derived from the private key
/// by `wg pubkey` and may be empty until the first derivation.
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    private_key: String,
    public_key: String,
}

impl KeyStore {
    pub async fn new(tools: &Tools, private_key: &str) -> KeyStore {
        let mut ks = KeyStore::default();
        ks.set_private_key(tools, private_key).await;
        ks
    }

    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Replace the private key and re-derive the public key. Returns whether
    /// the derivation worked.
    pub async fn set_private_key(&mut self, tools: &Tools, private_key: &str) -> bool {
        self.private_key = private_key.trim().into();
        match derive_public_key(tools, &self.private_key).await {
            Some(pk) => {
                self.public_key = pk;
                true
            }
            None => {
                self.public_key.clear();
                false
            }
        }
    }
}

pub async fn generate_private_key(tools: &Tools) -> Option<String> {
    match tools.genkey().await {
        Ok(k) if !k.is_empty() => Some(k),
        Ok(_) => None,
        Err(e) => {
            warn!("failed to generate private key: {}", e);
            None
        }
    }
}

pub async fn generate_preshared_key(tools: &Tools) -> Option<String> {
    match tools.genpsk().await {
        Ok(k) if !k.is_empty() => Some(k),
        Ok(_) => None,
        Err(e) => {
            warn!("failed to generate preshared key: {}", e);
            None
        }
    }
}

pub async fn derive_public_key(tools: &Tools, private_key: &str) -> Option<String> {
    if private_key.trim().is_empty() {
        return None;
    }
    match tools.pubkey(private_key).await {
        Ok(k) if !k.is_empty() => Some(k),
        Ok(_) => None,
        Err(e) => {
            warn!("failed to derive public key: {}", e);
            None
        }
    }
}
