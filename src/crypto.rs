//! Keyed primitives: the HMAC-SHA256 PRF used for every trapdoor and token
//! derivation, AEAD encryption of cell values, and the deterministic
//! one-block cipher that turns a row identifier into its stored form.
//!
//! All derived keys are 32 bytes; the type system enforces the key length,
//! so the only fallible operations are loading master key material and AEAD
//! encryption itself.

use std::fs;
use std::path::Path;

use aes::cipher::{generic_array::GenericArray, BlockEncrypt};
use aes::Aes128;
use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes128Gcm, KeyInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{BuildError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Length of the master secret and of every derived trapdoor.
pub const KEY_LEN: usize = 32;
/// Width of the stored RID ciphertext.
pub const RID_BLOCK_LEN: usize = 16;
/// Width of an XOR-encrypted EMM payload (one big-endian u64).
pub const PAYLOAD_LEN: usize = 8;

/// `PRF(key, msg)`: HMAC-SHA256 with a fixed 32-byte key.
pub fn prf(key: &[u8; KEY_LEN], msg: &[u8]) -> [u8; KEY_LEN] {
    // new_from_slice cannot fail for HMAC with a 32-byte key
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts 32-byte keys");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// A PRF-derived key. Trapdoors unlock one multi-map bucket each; secondary
/// trapdoors are chained off a parent trapdoor and an RID.
#[derive(Clone)]
pub struct Trapdoor {
    bytes: [u8; KEY_LEN],
}

impl Trapdoor {
    /// Bucket label for a dense counter: `PRF_T(counter_be)`.
    pub fn label(&self, counter: u64) -> Vec<u8> {
        prf(&self.bytes, &counter.to_be_bytes()).to_vec()
    }

    /// Server-side probe token for an RID: `PRF_T(rid_be)`.
    pub fn token(&self, rid: u64) -> Vec<u8> {
        prf(&self.bytes, &rid.to_be_bytes()).to_vec()
    }

    /// Secondary trapdoor `S = PRF_T(rid_be)`.
    pub fn secondary(&self, rid: u64) -> Trapdoor {
        Trapdoor {
            bytes: prf(&self.bytes, &rid.to_be_bytes()),
        }
    }

    /// Secondary trapdoor with a domain-separation byte:
    /// `S_j = PRF_T(rid_be ‖ j)`.
    pub fn secondary_j(&self, rid: u64, j: u8) -> Trapdoor {
        let mut msg = rid.to_be_bytes().to_vec();
        msg.push(j);
        Trapdoor {
            bytes: prf(&self.bytes, &msg),
        }
    }

    /// One-time-pad encryption of an RID payload:
    /// `rid_be ⊕ PRF_T(ctx)[..8]`.
    pub fn xor_rid(&self, ctx: &[u8], rid: u64) -> Vec<u8> {
        let pad = prf(&self.bytes, ctx);
        rid.to_be_bytes()
            .iter()
            .zip(pad.iter())
            .map(|(b, p)| b ^ p)
            .collect()
    }

    /// Inverse of [`xor_rid`](Self::xor_rid); XOR is its own inverse, this
    /// exists so callers do not repeat the pad derivation.
    pub fn unxor_rid(&self, ctx: &[u8], ciphertext: &[u8]) -> u64 {
        let pad = prf(&self.bytes, ctx);
        let mut out = [0u8; PAYLOAD_LEN];
        for (i, b) in ciphertext.iter().take(PAYLOAD_LEN).enumerate() {
            out[i] = b ^ pad[i];
        }
        u64::from_be_bytes(out)
    }
}

/// AEAD cipher for cell values, keyed by the scheme-wide data key.
///
/// Nonces are fresh and random per cell, so two encryptions of the same
/// plaintext differ. The multi-map layer provides all query selectivity;
/// cell ciphertexts never need to be comparable.
pub struct CellCipher {
    cipher: Aes128Gcm,
}

impl CellCipher {
    const NONCE_LEN: usize = 12;

    fn new(key: &[u8; 16]) -> Self {
        CellCipher {
            cipher: Aes128Gcm::new(GenericArray::from_slice(key)),
        }
    }

    /// Encrypts one cell, returning `nonce ‖ ciphertext ‖ tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
        let ct = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| BuildError::CellEncryption)?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Decrypts `nonce ‖ ciphertext ‖ tag`. Used by the test harness; the
    /// query processor holds its own copy of the data key.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < Self::NONCE_LEN {
            return Err(BuildError::CellEncryption);
        }
        let (nonce, ct) = data.split_at(Self::NONCE_LEN);
        self.cipher
            .decrypt(GenericArray::from_slice(nonce), ct)
            .map_err(|_| BuildError::CellEncryption)
    }
}

/// Deterministic encryption of row identifiers.
///
/// A single AES-128 block over `rid_be ‖ 0^8`. Determinism is required so
/// the ciphertext can serve as a stable row key in the encrypted table;
/// injectivity follows from the cipher being a permutation.
pub struct RidCipher {
    cipher: Aes128,
}

impl RidCipher {
    fn new(key: &[u8; 16]) -> Self {
        RidCipher {
            cipher: Aes128::new(GenericArray::from_slice(key)),
        }
    }

    pub fn encrypt(&self, rid: u64) -> Vec<u8> {
        let mut block = [0u8; RID_BLOCK_LEN];
        block[..8].copy_from_slice(&rid.to_be_bytes());
        let mut block = GenericArray::from(block);
        self.cipher.encrypt_block(&mut block);
        block.to_vec()
    }
}

/// The process-wide master secret.
///
/// Loaded once at startup, read-only afterwards, zeroized on drop. All
/// trapdoors, the data key and the RID key derive from it; it is never
/// written next to encrypted data.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        MasterKey { bytes }
    }

    /// Checked construction from raw key material; anything but exactly
    /// 32 bytes is a fatal key-length error.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LEN] =
            bytes
                .try_into()
                .map_err(|_| BuildError::InvalidKeyLength {
                    expected: KEY_LEN,
                    actual: bytes.len(),
                })?;
        Ok(MasterKey { bytes })
    }

    /// Reads key material from a file holding either 32 raw bytes or 64
    /// hex characters (surrounding whitespace ignored).
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path)?;
        if let Some(text) = std::str::from_utf8(&raw).ok().map(str::trim) {
            if text.len() == 2 * KEY_LEN {
                let mut bytes = [0u8; KEY_LEN];
                for (i, chunk) in text.as_bytes().chunks(2).enumerate() {
                    let pair = std::str::from_utf8(chunk).unwrap_or("zz");
                    bytes[i] = u8::from_str_radix(pair, 16).map_err(|_| {
                        BuildError::BadKeyMaterial {
                            path: path.to_path_buf(),
                            detail: "non-hex character".into(),
                        }
                    })?;
                }
                return Ok(MasterKey { bytes });
            }
        }
        Self::from_slice(&raw)
    }

    /// Master trapdoor for a predicate: `T = PRF_master(P)`.
    pub fn trapdoor(&self, predicate: &[u8]) -> Trapdoor {
        Trapdoor {
            bytes: prf(&self.bytes, predicate),
        }
    }

    /// Two-key trapdoor pair `T_j = PRF_master(P ‖ j)`, j ∈ {1,2}.
    /// The first keys labels, the second keys payloads.
    pub fn trapdoor_pair(&self, predicate: &[u8]) -> (Trapdoor, Trapdoor) {
        (
            self.trapdoor_j(predicate, 1),
            self.trapdoor_j(predicate, 2),
        )
    }

    pub fn trapdoor_j(&self, predicate: &[u8], j: u8) -> Trapdoor {
        let mut msg = predicate.to_vec();
        msg.push(j);
        Trapdoor {
            bytes: prf(&self.bytes, &msg),
        }
    }

    /// Opaque identifier for a table or column name: the hex form of
    /// `PRF_master(name)` truncated to 16 bytes. Stable across builds,
    /// reveals nothing about the name.
    pub fn opaque_name(&self, name: &str) -> String {
        let digest = prf(&self.bytes, name.as_bytes());
        let mut out = String::with_capacity(32);
        for b in &digest[..16] {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    pub fn cell_cipher(&self) -> CellCipher {
        let derived = prf(&self.bytes, b"cell-data-key");
        let mut key = [0u8; 16];
        key.copy_from_slice(&derived[..16]);
        CellCipher::new(&key)
    }

    pub fn rid_cipher(&self) -> RidCipher {
        let derived = prf(&self.bytes, b"rid-prp-key");
        let mut key = [0u8; 16];
        key.copy_from_slice(&derived[..16]);
        RidCipher::new(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn test_key() -> MasterKey {
        MasterKey::from_bytes(hex!(
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"
        ))
    }

    #[test]
    fn prf_is_deterministic_and_separated() {
        let key = hex!("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f");
        assert_eq!(prf(&key, b"filter~t~a~1"), prf(&key, b"filter~t~a~1"));
        assert_ne!(prf(&key, b"filter~t~a~1"), prf(&key, b"filter~t~a~2"));
    }

    #[test]
    fn trapdoor_pair_keys_are_independent() {
        let master = test_key();
        let (t1, t2) = master.trapdoor_pair(b"filter~data2~a~2");
        assert_ne!(t1.label(0), t2.label(0));
        // and neither matches the single-key trapdoor
        let t = master.trapdoor(b"filter~data2~a~2");
        assert_ne!(t.label(0), t1.label(0));
    }

    #[test]
    fn xor_rid_round_trip() {
        let master = test_key();
        let t = master.trapdoor(b"uncorrjoin~data2.b~data3.c");
        for rid in [0u64, 1, 41, u64::MAX] {
            let ct = t.xor_rid(b"v", rid);
            assert_eq!(ct.len(), PAYLOAD_LEN);
            assert_eq!(t.unxor_rid(b"v", &ct), rid);
        }
        // distinct contexts give distinct pads
        assert_ne!(t.xor_rid(b"l", 7), t.xor_rid(b"r", 7));
    }

    #[test]
    fn rid_cipher_is_deterministic_and_injective() {
        let master = test_key();
        let prp = master.rid_cipher();
        assert_eq!(prp.encrypt(5), prp.encrypt(5));
        assert_ne!(prp.encrypt(5), prp.encrypt(6));
        assert_eq!(prp.encrypt(5).len(), RID_BLOCK_LEN);
    }

    #[test]
    fn cell_cipher_round_trips_and_randomizes() {
        let master = test_key();
        let aead = master.cell_cipher();
        let ct1 = aead.encrypt(b"42").unwrap();
        let ct2 = aead.encrypt(b"42").unwrap();
        assert_ne!(ct1, ct2);
        assert_eq!(aead.decrypt(&ct1).unwrap(), b"42");
        assert_eq!(aead.decrypt(&ct2).unwrap(), b"42");
    }

    #[test]
    fn master_key_loads_hex_and_raw() {
        let dir = tempfile::tempdir().unwrap();
        let raw_path = dir.path().join("key.bin");
        std::fs::write(&raw_path, [7u8; KEY_LEN]).unwrap();
        let from_raw = MasterKey::load(&raw_path).unwrap();

        let hex_path = dir.path().join("key.hex");
        std::fs::write(&hex_path, "07".repeat(KEY_LEN)).unwrap();
        let from_hex = MasterKey::load(&hex_path).unwrap();

        assert_eq!(
            from_raw.trapdoor(b"p").label(0),
            from_hex.trapdoor(b"p").label(0)
        );
    }

    #[test]
    fn master_key_rejects_wrong_key_lengths() {
        assert!(matches!(
            MasterKey::from_slice(&[0u8; 31]),
            Err(BuildError::InvalidKeyLength {
                expected: 32,
                actual: 31
            })
        ));

        let dir = tempfile::tempdir().unwrap();
        let short_path = dir.path().join("key.bad");
        std::fs::write(&short_path, "too short").unwrap();
        assert!(matches!(
            MasterKey::load(&short_path),
            Err(BuildError::InvalidKeyLength { actual: 9, .. })
        ));

        // 64 characters that are not hex fall through as bad material
        let text_path = dir.path().join("key.txt");
        std::fs::write(&text_path, "z".repeat(2 * KEY_LEN)).unwrap();
        assert!(matches!(
            MasterKey::load(&text_path),
            Err(BuildError::BadKeyMaterial { .. })
        ));
    }
}
