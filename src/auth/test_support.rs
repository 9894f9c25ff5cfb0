//! Test-only RSA key and token minting.

use crate::auth::Jwk;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, traits::PublicKeyParts};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

pub(crate) fn signing_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("generate test RSA key")
    })
}

pub(crate) fn jwk(kid: &str) -> Jwk {
    let public = signing_key().to_public_key();
    Jwk {
        kty: "RSA".into(),
        kid: Some(kid.into()),
        alg: Some("RS256".into()),
        n: Some(URL_SAFE_NO_PAD.encode(public.n().to_bytes_be())),
        e: Some(URL_SAFE_NO_PAD.encode(public.e().to_bytes_be())),
    }
}

pub(crate) fn jwks_body(kid: &str) -> Value {
    let key = jwk(kid);
    serde_json::json!({
        "keys": [{
            "kty": key.kty,
            "kid": key.kid,
            "alg": key.alg,
            "use": "sig",
            "n": key.n,
            "e": key.e,
        }]
    })
}

pub(crate) fn mint(header: &Value, claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(header.to_string());
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    let signing_input = format!("{header}.{payload}");
    let digest = Sha256::digest(signing_input.as_bytes());
    let signature = signing_key()
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .expect("sign token");
    format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature))
}
