/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rsa::{
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};
use std::{fs, path::Path};

/// Signing identity of one local account. The key id is the fragment URL
/// remote verifiers dereference (`<actor>#main-key`).
#[derive(Clone)]
pub struct AccountKeys {
    pub private_key_pem: String,
    pub public_key_pem: String,
    pub key_id: String,
}

pub fn load_or_generate_account_keys(dir: impl AsRef<Path>, actor_url: &str) -> Result<AccountKeys> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).with_context(|| format!("create account dir: {}", dir.display()))?;

    let priv_path = dir.join("private.pem");
    let priv_pem = if priv_path.exists() {
        fs::read_to_string(&priv_path).with_context(|| format!("read {}", priv_path.display()))?
    } else {
        let mut rng = OsRng;
        let priv_key = RsaPrivateKey::new(&mut rng, 2048)?;
        let priv_pem = priv_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
        fs::write(&priv_path, &priv_pem)
            .with_context(|| format!("write {}", priv_path.display()))?;
        priv_pem
    };

    let private_key = RsaPrivateKey::from_pkcs8_pem(&priv_pem).context("parse private key pem")?;
    let public_key = RsaPublicKey::from(&private_key);
    let public_key_pem = public_key.to_public_key_pem(LineEnding::LF)?.to_string();

    let pub_path = dir.join("public.pem");
    if !pub_path.exists() {
        fs::write(&pub_path, &public_key_pem)
            .with_context(|| format!("write {}", pub_path.display()))?;
    }

    Ok(AccountKeys {
        private_key_pem: priv_pem,
        public_key_pem,
        key_id: format!("{actor_url}#main-key"),
    })
}
