/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use http::{HeaderMap, Method, Uri};
use httpdate::parse_http_date;
use rsa::{
    pkcs1v15::{Signature, SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    signature::{RandomizedSigner, SignatureEncoding, Verifier},
    RsaPrivateKey, RsaPublicKey,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;

/// Parsed `Signature:` request header.
#[derive(Debug)]
pub struct SignatureHeader {
    pub key_id: String,
    pub algorithm: Option<String>,
    pub headers: Vec<String>,
    pub signature: Vec<u8>,
}

pub fn parse_signature_header(value: &str) -> Result<SignatureHeader> {
    // keyId="...",algorithm="rsa-sha256",headers="(request-target) host date",signature="..."
    let mut fields = HashMap::<String, String>::new();
    for part in value.split(',') {
        let Some((k, v)) = part.trim().split_once('=') else {
            continue;
        };
        fields.insert(k.trim().to_string(), v.trim().trim_matches('"').to_string());
    }

    let key_id = fields
        .get("keyId")
        .cloned()
        .ok_or_else(|| anyhow!("Signature missing keyId"))?;
    let headers = fields
        .get("headers")
        .cloned()
        .unwrap_or_else(|| "date".to_string());
    let signature = B64
        .decode(
            fields
                .get("signature")
                .ok_or_else(|| anyhow!("Signature missing signature"))?
                .as_bytes(),
        )
        .context("decode signature")?;

    Ok(SignatureHeader {
        key_id,
        algorithm: fields.get("algorithm").cloned(),
        headers: headers
            .split_whitespace()
            .map(|h| h.to_ascii_lowercase())
            .collect(),
        signature,
    })
}

/// Canonical string covered by the signature: one `name: value` line per
/// signed header, with `(request-target)` expanded to method + path.
pub fn signing_string(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    signed_headers: &[String],
) -> Result<String> {
    let mut lines = Vec::with_capacity(signed_headers.len());
    for name in signed_headers {
        if name == "(request-target)" {
            let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();
            lines.push(format!(
                "(request-target): {} {}{}",
                method.as_str().to_ascii_lowercase(),
                uri.path(),
                query
            ));
            continue;
        }
        let header_name = http::header::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("bad signed header name: {name}"))?;
        let value = headers
            .get(&header_name)
            .ok_or_else(|| anyhow!("missing signed header: {name}"))?
            .to_str()
            .with_context(|| format!("invalid header value for {name}"))?;
        lines.push(format!("{name}: {}", value.trim()));
    }
    Ok(lines.join("\n"))
}

pub fn body_digest_header(body: &[u8]) -> String {
    format!("SHA-256={}", B64.encode(Sha256::digest(body)))
}

/// Signs a request in place: fills in Date, Host and (for non-empty bodies)
/// Digest, then adds the Signature header.
pub fn sign_request(
    private_key_pem: &str,
    key_id: &str,
    method: &Method,
    uri: &Uri,
    headers: &mut HeaderMap,
    body: &[u8],
    signed_headers: &[&str],
) -> Result<()> {
    if !headers.contains_key("Date") {
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());
        headers.insert("Date", date.parse().context("set Date")?);
    }

    let signed_lower: Vec<String> = signed_headers.iter().map(|h| h.to_ascii_lowercase()).collect();
    let want_digest = !body.is_empty() || signed_lower.iter().any(|h| h == "digest");
    if want_digest && !headers.contains_key("Digest") {
        headers.insert(
            "Digest",
            body_digest_header(body).parse().context("set Digest")?,
        );
    }

    if !headers.contains_key("Host") {
        if let Some(auth) = uri.authority() {
            headers.insert("Host", auth.as_str().parse().context("set Host")?);
        }
    }

    let to_sign = signing_string(method, uri, headers, &signed_lower)?;

    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem).context("parse private key pem")?;
    let signing_key = SigningKey::<Sha256>::new(private_key);
    let mut rng = rand::rngs::OsRng;
    let signature = signing_key.sign_with_rng(&mut rng, to_sign.as_bytes());

    let header = format!(
        "keyId=\"{key_id}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        signed_lower.join(" "),
        B64.encode(signature.to_bytes()),
    );
    headers.insert("Signature", header.parse().context("set Signature")?);
    Ok(())
}

pub fn verify_signature(public_key_pem: &str, to_sign: &str, signature: &[u8]) -> Result<()> {
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem).context("parse public key pem")?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let sig = Signature::try_from(signature).context("invalid rsa signature bytes")?;
    verifying_key
        .verify(to_sign.as_bytes(), &sig)
        .context("signature verify failed")?;
    Ok(())
}

pub fn verify_digest(headers: &HeaderMap, body: &[u8]) -> Result<()> {
    let Some(digest) = headers.get("Digest") else {
        return Ok(());
    };
    let digest = digest.to_str().context("Digest header not utf8")?;
    let Some((alg, value)) = digest.split_once('=') else {
        return Err(anyhow!("invalid Digest header"));
    };
    if !alg.trim().eq_ignore_ascii_case("SHA-256") {
        return Err(anyhow!("unsupported digest alg: {alg}"));
    }
    let expected = B64.decode(value.trim().as_bytes()).context("decode digest")?;
    if expected.as_slice() != Sha256::digest(body).as_slice() {
        return Err(anyhow!("digest mismatch"));
    }
    Ok(())
}

pub fn verify_date(headers: &HeaderMap, max_skew: Duration) -> Result<()> {
    let date = headers
        .get("Date")
        .ok_or_else(|| anyhow!("missing Date header"))?
        .to_str()
        .context("Date header not utf8")?;
    let ts = parse_http_date(date).context("parse Date header")?;
    let now = std::time::SystemTime::now();
    let skew = now
        .duration_since(ts)
        .or_else(|_| ts.duration_since(now))
        .unwrap_or_default();
    if skew > max_skew {
        return Err(anyhow!("Date skew too large: {}s", skew.as_secs()));
    }
    Ok(())
}
