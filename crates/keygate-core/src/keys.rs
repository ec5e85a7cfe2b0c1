//! Public key material decoding.
//!
//! A cosign key secret stores one or more PEM-encoded SPKI public keys under a
//! single field, concatenated back to back:
//!
//! ```text
//! -----BEGIN PUBLIC KEY-----
//! MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAE...
//! -----END PUBLIC KEY-----
//! -----BEGIN PUBLIC KEY-----
//! MCowBQYDK2VwAyEA...
//! -----END PUBLIC KEY-----
//! ```
//!
//! [`decode`] scans the blob block by block. A block that fails to decode is
//! recorded and skipped; the call only fails when no key at all survives.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use sha2::{Digest, Sha256};
use spki::der::pem::LineEnding;
use spki::der::{DecodePem, EncodePem, ErrorKind};
use spki::{ObjectIdentifier, SubjectPublicKeyInfoOwned};

use crate::error::{DecodeError, KeyMaterialError};

/// Default secret field holding the public keys.
pub const DEFAULT_SECRET_KEY_FIELD: &str = "cosign.pub";

const PEM_BEGIN: &str = "-----BEGIN ";
const PEM_END: &str = "-----END ";
const PEM_DASHES: &str = "-----";
const PUBLIC_KEY_LABEL: &str = "PUBLIC KEY";

const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");

/// Algorithm named by the SPKI `AlgorithmIdentifier`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    /// `id-ecPublicKey`; the curve is checked by the backend.
    Ecdsa,
    Ed25519,
    /// Any other algorithm (RSA, etc.), kept as its dotted OID.
    Other(String),
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ecdsa => f.write_str("ecdsa"),
            Self::Ed25519 => f.write_str("ed25519"),
            Self::Other(oid) => write!(f, "oid:{}", oid),
        }
    }
}

/// An SPKI-encoded public key.
///
/// Equality is equality of the DER bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    spki_der: Vec<u8>,
    pem: String,
    algorithm: KeyAlgorithm,
}

impl PublicKey {
    /// Parse an SPKI DER document.
    pub fn from_spki_der(der: &[u8]) -> Result<Self, String> {
        use spki::der::Decode;

        let spki = SubjectPublicKeyInfoOwned::from_der(der).map_err(|e| e.to_string())?;
        Self::from_spki(spki)
    }

    fn from_spki(spki: SubjectPublicKeyInfoOwned) -> Result<Self, String> {
        use spki::der::Encode;

        let oid = spki.algorithm.oid;
        let algorithm = if oid == OID_EC_PUBLIC_KEY {
            KeyAlgorithm::Ecdsa
        } else if oid == OID_ED25519 {
            KeyAlgorithm::Ed25519
        } else {
            KeyAlgorithm::Other(oid.to_string())
        };
        let spki_der = spki.to_der().map_err(|e| e.to_string())?;
        let pem = spki.to_pem(LineEnding::LF).map_err(|e| e.to_string())?;
        Ok(Self {
            spki_der,
            pem,
            algorithm,
        })
    }

    pub fn spki_der(&self) -> &[u8] {
        &self.spki_der
    }

    /// Normalized PEM encoding (LF line endings, no surrounding text).
    pub fn to_pem(&self) -> &str {
        &self.pem
    }

    pub fn algorithm(&self) -> &KeyAlgorithm {
        &self.algorithm
    }

    /// `sha256:<hex>` over the SPKI DER bytes.
    pub fn key_id(&self) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(&self.spki_der)))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("key_id", &self.key_id())
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

/// Result of a successful decode: the usable keys plus per-block failures.
#[derive(Debug, Clone, Default)]
pub struct DecodedKeys {
    pub keys: Vec<PublicKey>,
    pub errors: Vec<DecodeError>,
}

/// A PEM block located in a blob. Borrowed from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PemBlock<'a> {
    label: &'a str,
    /// From the BEGIN marker through the END line, or up to the next BEGIN
    /// marker when `truncated`.
    span: &'a str,
    /// No END line before the next BEGIN marker.
    truncated: bool,
}

/// Iterator over the PEM blocks of a blob, driven by an offset cursor.
///
/// A block whose END line is missing but which is followed by another BEGIN
/// marker is yielded as truncated and the scan resumes at that marker. A
/// trailing BEGIN marker with no END line ends the iteration.
struct PemBlocks<'a> {
    text: &'a str,
    cursor: usize,
}

impl<'a> PemBlocks<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, cursor: 0 }
    }
}

impl<'a> Iterator for PemBlocks<'a> {
    type Item = PemBlock<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let text = self.text;
        loop {
            let rest = text.get(self.cursor..)?;
            let begin = self.cursor + rest.find(PEM_BEGIN)?;
            let label_start = begin + PEM_BEGIN.len();

            let after_begin = &text[label_start..];
            let line_end = after_begin.find('\n').unwrap_or(after_begin.len());
            let header_line = after_begin[..line_end].trim_end_matches('\r');

            let Some(label) = header_line.strip_suffix(PEM_DASHES) else {
                // Not a real header line; resume scanning after the marker.
                self.cursor = label_start;
                continue;
            };

            let body_start = label_start + line_end;
            let end_marker = format!("{}{}{}", PEM_END, label, PEM_DASHES);
            let end = text[body_start..].find(&end_marker);
            let next_begin = text[body_start..].find(PEM_BEGIN);

            match (end, next_begin) {
                (Some(end), next) if next.map_or(true, |n| end < n) => {
                    let block_end = body_start + end + end_marker.len();
                    self.cursor = block_end;
                    return Some(PemBlock {
                        label,
                        span: &text[begin..block_end],
                        truncated: false,
                    });
                }
                (_, Some(next)) => {
                    let block_end = body_start + next;
                    self.cursor = block_end;
                    return Some(PemBlock {
                        label,
                        span: &text[begin..block_end],
                        truncated: true,
                    });
                }
                _ => return None,
            }
        }
    }
}

/// Decode every public key in `blob`, in order of appearance.
///
/// Duplicate keys are returned once. Fails with
/// [`KeyMaterialError::MalformedKeyMaterial`] when blocks exist but none
/// decode, and with [`KeyMaterialError::NoKeysFound`] when there are no
/// blocks.
pub fn decode(blob: &[u8]) -> Result<DecodedKeys, KeyMaterialError> {
    let text = String::from_utf8_lossy(blob);
    let mut decoded = DecodedKeys::default();

    for (index, block) in PemBlocks::new(&text).enumerate() {
        match decode_block(index, &block) {
            Ok(key) => {
                if decoded.keys.contains(&key) {
                    tracing::debug!(block = index, key_id = %key.key_id(), "duplicate key, skipping");
                    continue;
                }
                tracing::debug!(block = index, key_id = %key.key_id(), algorithm = %key.algorithm(), "decoded public key");
                decoded.keys.push(key);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode key block");
                decoded.errors.push(e);
            }
        }
    }

    if decoded.keys.is_empty() {
        let failed_blocks = decoded.errors.len();
        return match decoded.errors.into_iter().next() {
            Some(source) => Err(KeyMaterialError::MalformedKeyMaterial {
                source,
                failed_blocks,
            }),
            None => Err(KeyMaterialError::NoKeysFound),
        };
    }

    Ok(decoded)
}

fn decode_block(index: usize, block: &PemBlock<'_>) -> Result<PublicKey, DecodeError> {
    if block.label != PUBLIC_KEY_LABEL {
        return Err(DecodeError::UnexpectedLabel {
            index,
            label: block.label.to_string(),
        });
    }
    if block.truncated {
        return Err(DecodeError::Pem {
            index,
            reason: format!("missing {}{}{} line", PEM_END, block.label, PEM_DASHES),
        });
    }

    let spki = SubjectPublicKeyInfoOwned::from_pem(block.span.trim()).map_err(|e| match e.kind() {
        ErrorKind::Pem(_) => DecodeError::Pem {
            index,
            reason: e.to_string(),
        },
        _ => DecodeError::Spki {
            index,
            reason: e.to_string(),
        },
    })?;

    PublicKey::from_spki(spki).map_err(|reason| DecodeError::Spki { index, reason })
}

/// Decode the keys stored under `field` in a secret's data map.
pub fn decode_secret(
    data: &BTreeMap<String, Vec<u8>>,
    field: &str,
) -> Result<DecodedKeys, KeyMaterialError> {
    let blob = data
        .get(field)
        .ok_or_else(|| KeyMaterialError::MissingSecretField {
            field: field.to_string(),
        })?;
    decode(blob)
}

/// Read and decode a local PEM file.
pub fn load_key_file(path: &Path) -> Result<DecodedKeys, KeyMaterialError> {
    let blob = std::fs::read(path).map_err(|e| KeyMaterialError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    decode(&blob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use ed25519_dalek::SigningKey;
    use p256::pkcs8::{EncodePublicKey, LineEnding};

    fn ed25519_pem() -> String {
        let signing_key = SigningKey::generate(&mut rand::thread_rng());
        signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap()
    }

    fn p256_pem() -> String {
        let signing_key = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
        signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap()
    }

    #[test]
    fn test_decode_single_key() {
        let pem = p256_pem();
        let decoded = decode(pem.as_bytes()).unwrap();
        assert_eq!(decoded.keys.len(), 1);
        assert!(decoded.errors.is_empty());
        assert_eq!(decoded.keys[0].algorithm(), &KeyAlgorithm::Ecdsa);
    }

    #[test]
    fn test_decode_concatenated_keys_in_order() {
        let pems = [p256_pem(), ed25519_pem(), p256_pem()];
        // No separator between blocks at all.
        let blob: String = pems.iter().map(|p| p.trim_end()).collect();

        let decoded = decode(blob.as_bytes()).unwrap();
        assert_eq!(decoded.keys.len(), 3);
        for (key, pem) in decoded.keys.iter().zip(&pems) {
            let expected = decode(pem.as_bytes()).unwrap().keys.remove(0);
            assert_eq!(key, &expected);
        }
        assert_eq!(decoded.keys[1].algorithm(), &KeyAlgorithm::Ed25519);
    }

    #[test]
    fn test_decode_mixed_valid_and_malformed() {
        let good1 = p256_pem();
        let good2 = ed25519_pem();
        let bad_base64 = "-----BEGIN PUBLIC KEY-----\n!!!not base64!!!\n-----END PUBLIC KEY-----\n";
        let bad_spki = "-----BEGIN PUBLIC KEY-----\nAAECAwQ=\n-----END PUBLIC KEY-----\n";
        let blob = format!("{}{}{}{}", bad_base64, good1, bad_spki, good2);

        let decoded = decode(blob.as_bytes()).unwrap();
        assert_eq!(decoded.keys.len(), 2);
        assert_eq!(decoded.errors.len(), 2);
        assert!(matches!(decoded.errors[0], DecodeError::Pem { index: 0, .. }));
        assert!(matches!(decoded.errors[1], DecodeError::Spki { index: 2, .. }));
    }

    #[test]
    fn test_decode_empty_blob() {
        let result = decode(b"");
        assert!(matches!(result, Err(KeyMaterialError::NoKeysFound)));

        let result = decode(b"just some text, no pem here");
        assert!(matches!(result, Err(KeyMaterialError::NoKeysFound)));
    }

    #[test]
    fn test_decode_fully_malformed_wraps_first_error() {
        let blob = "-----BEGIN PUBLIC KEY-----\nAAECAwQ=\n-----END PUBLIC KEY-----\n\
                    -----BEGIN CERTIFICATE-----\nAAECAwQ=\n-----END CERTIFICATE-----\n";
        match decode(blob.as_bytes()) {
            Err(KeyMaterialError::MalformedKeyMaterial {
                source,
                failed_blocks,
            }) => {
                assert_eq!(failed_blocks, 2);
                assert!(matches!(source, DecodeError::Spki { index: 0, .. }));
            }
            other => panic!("expected MalformedKeyMaterial, got {:?}", other),
        }
    }

    #[test]
    fn test_unexpected_label_recorded() {
        let blob = format!(
            "-----BEGIN CERTIFICATE-----\nAAECAwQ=\n-----END CERTIFICATE-----\n{}",
            ed25519_pem()
        );
        let decoded = decode(blob.as_bytes()).unwrap();
        assert_eq!(decoded.keys.len(), 1);
        assert_eq!(
            decoded.errors,
            vec![DecodeError::UnexpectedLabel {
                index: 0,
                label: "CERTIFICATE".to_string()
            }]
        );
    }

    #[test]
    fn test_unterminated_trailing_block_stops_scan() {
        let good = p256_pem();
        let blob = format!("{}-----BEGIN PUBLIC KEY-----\nMFkwEwYHKoZIzj0CAQYIKoZIzj0D", good);
        let decoded = decode(blob.as_bytes()).unwrap();
        assert_eq!(decoded.keys.len(), 1);
        assert!(decoded.errors.is_empty());
    }

    #[test]
    fn test_truncated_block_does_not_swallow_next_key() {
        let good = p256_pem();
        let blob = format!("-----BEGIN PUBLIC KEY-----\nMFkwEwYHKoZIzj0CAQ\n{}", good);

        let decoded = decode(blob.as_bytes()).unwrap();
        assert_eq!(decoded.keys.len(), 1);
        assert_eq!(decoded.keys[0], decode(good.as_bytes()).unwrap().keys.remove(0));
        assert_eq!(decoded.errors.len(), 1);
        match &decoded.errors[0] {
            DecodeError::Pem { index: 0, reason } => {
                assert!(reason.contains("missing -----END PUBLIC KEY-----"), "{reason}")
            }
            other => panic!("expected truncated block error, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_block_before_other_label() {
        let good = ed25519_pem();
        let blob = format!(
            "-----BEGIN PUBLIC KEY-----\nAAAA\n-----BEGIN CERTIFICATE-----\nAAECAwQ=\n-----END CERTIFICATE-----\n{}",
            good
        );

        let decoded = decode(blob.as_bytes()).unwrap();
        assert_eq!(decoded.keys.len(), 1);
        assert_eq!(decoded.errors.len(), 2);
        assert!(matches!(decoded.errors[0], DecodeError::Pem { index: 0, .. }));
        assert!(matches!(
            decoded.errors[1],
            DecodeError::UnexpectedLabel { index: 1, .. }
        ));
    }

    #[test]
    fn test_malformed_message_carries_first_cause() {
        let blob = "-----BEGIN PUBLIC KEY-----\n!!!not base64!!!\n-----END PUBLIC KEY-----\n\
                    -----BEGIN PUBLIC KEY-----\nAAECAwQ=\n-----END PUBLIC KEY-----\n";
        let err = decode(blob.as_bytes()).unwrap_err();

        let first = match &err {
            KeyMaterialError::MalformedKeyMaterial { source, .. } => source.clone(),
            other => panic!("expected MalformedKeyMaterial, got {:?}", other),
        };
        let message = err.to_string();
        assert!(message.starts_with("malformed key material: block 0: invalid PEM body"));
        assert!(message.ends_with(&first.to_string()));
        assert!(!message.contains("block 1"));

        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source, Some(first.to_string()));
    }

    #[test]
    fn test_only_unterminated_block_is_no_keys() {
        let result = decode(b"-----BEGIN PUBLIC KEY-----\nAAAA\n");
        assert!(matches!(result, Err(KeyMaterialError::NoKeysFound)));
    }

    #[test]
    fn test_duplicate_keys_collapse() {
        let pem = p256_pem();
        let other = ed25519_pem();
        let blob = format!("{}{}{}", pem, other, pem);
        let decoded = decode(blob.as_bytes()).unwrap();
        assert_eq!(decoded.keys.len(), 2);
        assert!(decoded.errors.is_empty());
    }

    #[test]
    fn test_crlf_and_surrounding_text() {
        let pem = ed25519_pem().replace('\n', "\r\n");
        let blob = format!("# rotated 2024-01\r\n{}trailing notes\r\n", pem);
        let decoded = decode(blob.as_bytes()).unwrap();
        assert_eq!(decoded.keys.len(), 1);
    }

    #[test]
    fn test_unknown_algorithm_still_decodes() {
        // Structurally valid SPKI with an RSA OID; usability is the backend's call.
        let der: [u8; 22] = [
            0x30, 0x14, 0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01,
            0x01, 0x05, 0x00, 0x03, 0x03, 0x00, 0x30, 0x00,
        ];
        let rsa_spki = format!(
            "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n",
            BASE64.encode(der)
        );
        let decoded = decode(rsa_spki.as_bytes()).unwrap();
        assert_eq!(
            decoded.keys[0].algorithm(),
            &KeyAlgorithm::Other("1.2.840.113549.1.1.1".to_string())
        );
    }

    #[test]
    fn test_key_id_format() {
        let decoded = decode(p256_pem().as_bytes()).unwrap();
        let key_id = decoded.keys[0].key_id();
        assert!(key_id.starts_with("sha256:"));
        assert_eq!(key_id.len(), 7 + 64);
    }

    #[test]
    fn test_decode_secret_field() {
        let mut data = BTreeMap::new();
        data.insert("cosign.pub".to_string(), p256_pem().into_bytes());

        let decoded = decode_secret(&data, DEFAULT_SECRET_KEY_FIELD).unwrap();
        assert_eq!(decoded.keys.len(), 1);

        let missing = decode_secret(&data, "other.pub");
        assert!(matches!(
            missing,
            Err(KeyMaterialError::MissingSecretField { .. })
        ));
    }

    #[test]
    fn test_load_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cosign.pub");
        std::fs::write(&path, format!("{}{}", p256_pem(), ed25519_pem())).unwrap();

        let decoded = load_key_file(&path).unwrap();
        assert_eq!(decoded.keys.len(), 2);

        let missing = load_key_file(&dir.path().join("nope.pub"));
        assert!(matches!(missing, Err(KeyMaterialError::Io { .. })));
    }
}
