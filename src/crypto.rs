// src/crypto.rs
// RSA identities, envelope signatures, and hybrid message encryption.
//
// Deployment contract: signatures are RSA-PSS over SHA-256 of
// canonical(data) || ascii_decimal(counter); key wrap is RSA-OAEP(SHA-256);
// the body cipher is AES-256-GCM with a 96-bit IV.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::pss::{BlindedSigningKey, Signature, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const RSA_BITS: usize = 2048;
const AES_KEY_LEN: usize = 32;
const IV_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    BadKey(String),

    #[error("signature verification failed")]
    BadSignature,

    #[error("ciphertext rejected")]
    BadCiphertext,
}

/// A long-term RSA identity: the key pair plus the derived wire forms that
/// get used on every envelope (Base64 DER public key, fingerprint).
#[derive(Clone)]
pub struct Identity {
    pub private: RsaPrivateKey,
    pub public: RsaPublicKey,
    pub public_b64: String,
    pub fingerprint: String,
}

impl Identity {
    pub fn generate() -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
            .map_err(|e| CryptoError::BadKey(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        let public_b64 = export_public_b64(&public)?;
        let fingerprint = fingerprint(&public)?;
        Ok(Self {
            private,
            public,
            public_b64,
            fingerprint,
        })
    }
}

/// Base64 of the DER-encoded SubjectPublicKeyInfo, the wire form of a
/// public key.
pub fn export_public_b64(public: &RsaPublicKey) -> Result<String, CryptoError> {
    let der = public
        .to_public_key_der()
        .map_err(|e| CryptoError::BadKey(e.to_string()))?;
    Ok(BASE64.encode(der.as_bytes()))
}

pub fn import_public_b64(b64: &str) -> Result<RsaPublicKey, CryptoError> {
    let der = BASE64
        .decode(b64.trim())
        .map_err(|e| CryptoError::BadKey(format!("public key base64: {}", e)))?;
    RsaPublicKey::from_public_key_der(&der).map_err(|e| CryptoError::BadKey(e.to_string()))
}

/// Fingerprint: Base64(SHA-256(DER SPKI)). The canonical client identifier.
pub fn fingerprint(public: &RsaPublicKey) -> Result<String, CryptoError> {
    let der = public
        .to_public_key_der()
        .map_err(|e| CryptoError::BadKey(e.to_string()))?;
    let digest = Sha256::digest(der.as_bytes());
    Ok(BASE64.encode(digest))
}

fn signing_message(data: &[u8], counter: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(data.len() + 20);
    msg.extend_from_slice(data);
    msg.extend_from_slice(counter.to_string().as_bytes());
    msg
}

/// Sign canonical(data) || ascii_decimal(counter), returning Base64.
pub fn sign(private: &RsaPrivateKey, data: &[u8], counter: u64) -> Result<String, CryptoError> {
    let key = BlindedSigningKey::<Sha256>::new(private.clone());
    let sig = key
        .try_sign_with_rng(&mut OsRng, &signing_message(data, counter))
        .map_err(|_| CryptoError::BadSignature)?;
    Ok(BASE64.encode(sig.to_vec()))
}

/// Verify a Base64 envelope signature. Returns false on any decode or
/// verification failure.
pub fn verify(public: &RsaPublicKey, data: &[u8], counter: u64, sig_b64: &str) -> bool {
    let sig_bytes = match BASE64.decode(sig_b64.trim()) {
        Ok(b) => b,
        Err(_) => return false,
    };
    let sig = match Signature::try_from(sig_bytes.as_slice()) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let key = VerifyingKey::<Sha256>::new(public.clone());
    key.verify(&signing_message(data, counter), &sig).is_ok()
}

/// Output of [`hybrid_encrypt`], already in wire encoding.
#[derive(Debug, Clone)]
pub struct HybridCiphertext {
    pub iv: String,
    pub ciphertext: String,
    pub symm_keys: Vec<String>,
}

/// Encrypt once under a fresh AES-256-GCM key, wrapping that key for every
/// recipient under RSA-OAEP(SHA-256). `symm_keys[i]` belongs to
/// `recipients[i]`.
pub fn hybrid_encrypt(
    recipients: &[RsaPublicKey],
    plaintext: &[u8],
) -> Result<HybridCiphertext, CryptoError> {
    let mut key_bytes = [0u8; AES_KEY_LEN];
    OsRng.fill_bytes(&mut key_bytes);
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new_from_slice(&key_bytes)
        .map_err(|e| CryptoError::BadKey(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::BadCiphertext)?;

    let mut symm_keys = Vec::with_capacity(recipients.len());
    for public in recipients {
        let wrapped = public
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &key_bytes)
            .map_err(|e| CryptoError::BadKey(e.to_string()))?;
        symm_keys.push(BASE64.encode(wrapped));
    }

    Ok(HybridCiphertext {
        iv: BASE64.encode(iv),
        ciphertext: BASE64.encode(ciphertext),
        symm_keys,
    })
}

/// Try each wrapped key in turn; the first one that unwraps to a well-formed
/// AES key and authenticates the ciphertext wins. Anything else is
/// `BadCiphertext`, which receivers treat as "not for me".
pub fn hybrid_decrypt(
    private: &RsaPrivateKey,
    iv_b64: &str,
    ciphertext_b64: &str,
    symm_keys: &[String],
) -> Result<Vec<u8>, CryptoError> {
    let iv = BASE64
        .decode(iv_b64.trim())
        .map_err(|_| CryptoError::BadCiphertext)?;
    if iv.len() != IV_LEN {
        return Err(CryptoError::BadCiphertext);
    }
    let ciphertext = BASE64
        .decode(ciphertext_b64.trim())
        .map_err(|_| CryptoError::BadCiphertext)?;

    for wrapped_b64 in symm_keys {
        let wrapped = match BASE64.decode(wrapped_b64.trim()) {
            Ok(b) => b,
            Err(_) => continue,
        };
        let key_bytes = match private.decrypt(Oaep::new::<Sha256>(), &wrapped) {
            Ok(k) => k,
            Err(_) => continue,
        };
        if key_bytes.len() != AES_KEY_LEN {
            continue;
        }
        let cipher = match Aes256Gcm::new_from_slice(&key_bytes) {
            Ok(c) => c,
            Err(_) => continue,
        };
        if let Ok(plaintext) = cipher.decrypt(Nonce::from_slice(&iv), ciphertext.as_slice()) {
            return Ok(plaintext);
        }
    }
    Err(CryptoError::BadCiphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity::generate().expect("keygen")
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let id = identity();
        let again = fingerprint(&id.public).unwrap();
        assert_eq!(id.fingerprint, again);

        let other = identity();
        assert_ne!(id.fingerprint, other.fingerprint);
    }

    #[test]
    fn public_key_round_trips_through_b64() {
        let id = identity();
        let imported = import_public_b64(&id.public_b64).unwrap();
        assert_eq!(fingerprint(&imported).unwrap(), id.fingerprint);
    }

    #[test]
    fn import_rejects_garbage() {
        assert!(import_public_b64("not base64 at all!!!").is_err());
        assert!(import_public_b64(&BASE64.encode(b"not a key")).is_err());
    }

    #[test]
    fn sign_verify_round_trip() {
        let id = identity();
        let data = br#"{"message":"hi","type":"public_chat"}"#;
        let sig = sign(&id.private, data, 7).unwrap();
        assert!(verify(&id.public, data, 7, &sig));
    }

    #[test]
    fn verify_fails_on_tampered_data_or_counter() {
        let id = identity();
        let data = b"payload bytes";
        let sig = sign(&id.private, data, 3).unwrap();

        assert!(!verify(&id.public, b"payload byteZ", 3, &sig));
        assert!(!verify(&id.public, data, 4, &sig));
        let other = identity();
        assert!(!verify(&other.public, data, 3, &sig));
        assert!(!verify(&id.public, data, 3, "!!not-base64!!"));
    }

    #[test]
    fn hybrid_round_trip_for_every_recipient() {
        let a = identity();
        let b = identity();
        let c = identity();
        let plaintext = b"the neighbourhood is quiet tonight";

        let sealed =
            hybrid_encrypt(&[a.public.clone(), b.public.clone(), c.public.clone()], plaintext)
                .unwrap();
        assert_eq!(sealed.symm_keys.len(), 3);

        for id in [&a, &b, &c] {
            let opened =
                hybrid_decrypt(&id.private, &sealed.iv, &sealed.ciphertext, &sealed.symm_keys)
                    .unwrap();
            assert_eq!(opened, plaintext);
        }
    }

    #[test]
    fn hybrid_decrypt_fails_for_non_recipient() {
        let a = identity();
        let outsider = identity();
        let sealed = hybrid_encrypt(&[a.public.clone()], b"secret").unwrap();

        let err = hybrid_decrypt(
            &outsider.private,
            &sealed.iv,
            &sealed.ciphertext,
            &sealed.symm_keys,
        )
        .unwrap_err();
        assert!(matches!(err, CryptoError::BadCiphertext));
    }

    #[test]
    fn hybrid_decrypt_rejects_tampered_ciphertext() {
        let a = identity();
        let sealed = hybrid_encrypt(&[a.public.clone()], b"secret").unwrap();

        let mut ct = BASE64.decode(&sealed.ciphertext).unwrap();
        ct[0] ^= 0x01;
        let tampered = BASE64.encode(ct);

        let err =
            hybrid_decrypt(&a.private, &sealed.iv, &tampered, &sealed.symm_keys).unwrap_err();
        assert!(matches!(err, CryptoError::BadCiphertext));
    }
}
