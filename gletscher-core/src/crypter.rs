//! Keyed HMAC-SHA-256 digesting, per-chunk AES-256-CFB8 encryption and the
//! opportunistic bzip2 compression heuristic.

use aes::Aes256;
use cfb8::cipher::{AsyncStreamCipher, KeyIvInit};
use cfb8::{Decryptor, Encryptor};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::Error;

type Aes256Cfb8Enc = Encryptor<Aes256>;
type Aes256Cfb8Dec = Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const IV_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;

const NO_COMPRESSION_PREFIX: u8 = 0;
const BZIP2_COMPRESSION_PREFIX: u8 = 1;

/// Current on-disk chunk layout. See [`Crypter::decrypt_chunk`] for the
/// legacy version-1 layout still readable for old archives.
pub const CURRENT_STORAGE_VERSION: u8 = 2;

/// Digests, encrypts and decrypts chunk plaintext under a single 32-byte
/// secret key shared by the whole backup.
pub struct Crypter {
    secret_key: [u8; KEY_SIZE],
}

impl Crypter {
    pub fn new(secret_key: [u8; KEY_SIZE]) -> Self {
        Self { secret_key }
    }

    /// `HMAC-SHA-256(secret_key, bytes)`, used both as the content-address
    /// digest for chunks and to sign the backup's uuid in the config file.
    pub fn hash(&self, bytes: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&self.secret_key).expect("key is valid length");
        mac.update(bytes);
        mac.finalize().into_bytes().into()
    }

    /// Encrypt one chunk for storage-version 2: `IV(16) ‖
    /// AES256-CFB8(chunk_key, IV, prefix ‖ maybe-bzip2(plaintext))` where
    /// `chunk_key = secret_key XOR digest`.
    pub fn encrypt_chunk(&self, digest: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
        let chunk_key = xor_key(&self.secret_key, digest);
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let payload = compress_or_leave_alone(plaintext);

        let cipher = Aes256Cfb8Enc::new((&chunk_key).into(), (&iv).into());
        let mut out = payload;
        cipher.encrypt(&mut out);

        let mut result = Vec::with_capacity(IV_SIZE + out.len());
        result.extend_from_slice(&iv);
        result.extend_from_slice(&out);
        result
    }

    /// Decrypt one chunk, honoring the `storage_version` recorded in the
    /// index. Version 1 is legacy: no per-chunk key derivation, a plain
    /// `secret_key`-keyed cipher over bzip2-compressed plaintext with no
    /// compression-indicator byte.
    pub fn decrypt_chunk(
        &self,
        storage_version: u8,
        digest: &[u8; 32],
        data: &[u8],
    ) -> Result<Vec<u8>, Error> {
        match storage_version {
            1 => {
                if data.len() < IV_SIZE {
                    return Err(Error::IntegrityFailure(
                        "storage-version-1 record shorter than one IV".into(),
                    ));
                }
                let (iv, ciphertext) = data.split_at(IV_SIZE);
                let cipher = Aes256Cfb8Dec::new((&self.secret_key).into(), iv.into());
                let mut buf = ciphertext.to_vec();
                cipher.decrypt(&mut buf);
                decompress_bzip2(&buf)
            }
            2 => {
                if data.len() < IV_SIZE + 1 {
                    return Err(Error::IntegrityFailure(
                        "storage-version-2 record shorter than one IV and prefix byte".into(),
                    ));
                }
                let (iv, ciphertext) = data.split_at(IV_SIZE);
                let chunk_key = xor_key(&self.secret_key, digest);
                let cipher = Aes256Cfb8Dec::new((&chunk_key).into(), iv.into());
                let mut buf = ciphertext.to_vec();
                cipher.decrypt(&mut buf);
                decompress_or_leave_alone(&buf)
            }
            other => Err(Error::UnknownStorageVersion(other)),
        }
    }

    /// Random-IV AES-256-CFB8 cipher keyed by `secret_key`, used by the
    /// kv-pack container to encrypt catalog/index records.
    pub fn new_stream_cipher(&self) -> ([u8; IV_SIZE], Aes256Cfb8Enc) {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        let cipher = Aes256Cfb8Enc::new((&self.secret_key).into(), (&iv).into());
        (iv, cipher)
    }

    /// Reconstruct the stream decryptor for a kv-pack given the IV it was
    /// written with.
    pub fn stream_decryptor(&self, iv: &[u8; IV_SIZE]) -> Aes256Cfb8Dec {
        Aes256Cfb8Dec::new((&self.secret_key).into(), iv.into())
    }

    pub fn new_hmac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret_key).expect("key is valid length")
    }
}

fn xor_key(secret_key: &[u8; KEY_SIZE], digest: &[u8; 32]) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    for i in 0..KEY_SIZE {
        key[i] = secret_key[i] ^ digest[i];
    }
    key
}

/// Decision: for plaintexts < 128 KiB, compress and keep only if shorter;
/// else sample 64 KiB from the middle and use bzip2 only if the sample
/// compresses to < 0.90x its length.
fn compress_or_leave_alone(plaintext: &[u8]) -> Vec<u8> {
    const SMALL_THRESHOLD: usize = 128 * 1024;
    const SAMPLE_HALF: usize = 32 * 1024;

    if plaintext.len() < SMALL_THRESHOLD {
        let compressed = bzip2_compress(plaintext);
        if compressed.len() < plaintext.len() {
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(BZIP2_COMPRESSION_PREFIX);
            out.extend_from_slice(&compressed);
            return out;
        }
    } else {
        let middle = plaintext.len() / 2;
        let start = middle.saturating_sub(SAMPLE_HALF);
        let end = (middle + SAMPLE_HALF).min(plaintext.len());
        let sample = &plaintext[start..end];
        let compressed_sample = bzip2_compress(sample);
        if (compressed_sample.len() as f64) < 0.90 * (sample.len() as f64) {
            let compressed = bzip2_compress(plaintext);
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(BZIP2_COMPRESSION_PREFIX);
            out.extend_from_slice(&compressed);
            return out;
        }
    }

    let mut out = Vec::with_capacity(1 + plaintext.len());
    out.push(NO_COMPRESSION_PREFIX);
    out.extend_from_slice(plaintext);
    out
}

fn decompress_or_leave_alone(payload: &[u8]) -> Result<Vec<u8>, Error> {
    let (prefix, body) = payload
        .split_first()
        .ok_or_else(|| Error::IntegrityFailure("empty chunk payload".into()))?;
    match *prefix {
        NO_COMPRESSION_PREFIX => Ok(body.to_vec()),
        BZIP2_COMPRESSION_PREFIX => decompress_bzip2(body),
        other => Err(Error::IntegrityFailure(format!(
            "unknown compression prefix: {}",
            other
        ))),
    }
}

fn bzip2_compress(data: &[u8]) -> Vec<u8> {
    use bzip2::write::BzEncoder;
    use bzip2::Compression;
    use std::io::Write;

    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data).expect("compressing to a Vec cannot fail");
    encoder.finish().expect("compressing to a Vec cannot fail")
}

fn decompress_bzip2(data: &[u8]) -> Result<Vec<u8>, Error> {
    use bzip2::read::BzDecoder;
    use std::io::Read;

    let mut decoder = BzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::IntegrityFailure(format!("bzip2 decompression failed: {}", e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_known_answer() {
        let key = [0xAAu8; 20];
        let mut padded = [0u8; KEY_SIZE];
        // The KAT uses a 20-byte key; HMAC accepts any length, so we exercise
        // it through a raw Hmac instance rather than the 32-byte Crypter key.
        let mut mac = HmacSha256::new_from_slice(&key).unwrap();
        mac.update(&[0xDDu8; 50]);
        let digest = mac.finalize().into_bytes();
        assert_eq!(
            hex::encode(digest),
            "773ea91e36800e46854db8ebd09181a72959098b3ef8c122d9635514ced565fe"
        );
        let _ = padded; // silence unused warning if KEY_SIZE ever changes
    }

    #[test]
    fn aes_cfb8_known_answer() {
        // NIST 800-38A F.3.11, first 21 bytes of the CFB8 test vector.
        let key: [u8; 32] = hex::decode(
            "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4",
        )
        .unwrap()
        .try_into()
        .unwrap();
        let iv: [u8; 16] =
            hex::decode("000102030405060708090a0b0c0d0e0f").unwrap().try_into().unwrap();
        let plaintext = hex::decode("6bc1bee22e409f96e93d7e117393172aae2d").unwrap();
        let cipher = Aes256Cfb8Enc::new((&key).into(), (&iv).into());
        let mut buf = plaintext.clone();
        cipher.encrypt(&mut buf);
        assert_eq!(hex::encode(&buf), "dc1f1a8520a64db55fcc8ac554844e889700");

        let cipher = Aes256Cfb8Dec::new((&key).into(), (&iv).into());
        let mut roundtrip = buf.clone();
        cipher.decrypt(&mut roundtrip);
        assert_eq!(roundtrip, plaintext);
    }

    #[test]
    fn chunk_round_trip_v2() {
        let crypter = Crypter::new([b'0'; KEY_SIZE]);
        let plaintext = b"a small chunk of data!";
        let digest = crypter.hash(plaintext);
        let encrypted = crypter.encrypt_chunk(&digest, plaintext);
        // 16-byte IV + 1-byte prefix + 22 bytes of incompressible plaintext.
        assert_eq!(encrypted.len(), 16 + 1 + plaintext.len());
        let decrypted = crypter
            .decrypt_chunk(CURRENT_STORAGE_VERSION, &digest, &encrypted)
            .unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn chunk_round_trip_large_compressible() {
        let crypter = Crypter::new([7u8; KEY_SIZE]);
        let plaintext = vec![b'a'; 256 * 1024];
        let digest = crypter.hash(&plaintext);
        let encrypted = crypter.encrypt_chunk(&digest, &plaintext);
        let decrypted = crypter
            .decrypt_chunk(CURRENT_STORAGE_VERSION, &digest, &encrypted)
            .unwrap();
        assert_eq!(decrypted, plaintext);
        // Highly repetitive data compresses well past the large-chunk heuristic.
        assert!(encrypted.len() < plaintext.len());
    }

    #[test]
    fn legacy_storage_version_1_round_trip() {
        let crypter = Crypter::new([3u8; KEY_SIZE]);
        let plaintext = b"legacy chunk payload";
        let digest = crypter.hash(plaintext);

        // Hand-build a version-1 record the way DataStreamer used to.
        let compressed = bzip2_compress(plaintext);
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        let cipher = Aes256Cfb8Enc::new((&crypter.secret_key).into(), (&iv).into());
        let mut ciphertext = compressed;
        cipher.encrypt(&mut ciphertext);
        let mut record = Vec::new();
        record.extend_from_slice(&iv);
        record.extend_from_slice(&ciphertext);

        let decrypted = crypter.decrypt_chunk(1, &digest, &record).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn digests_diverge_for_identical_plaintext_when_truncated() {
        // Sanity check on the XOR-with-digest rationale in the design notes:
        // two different digests over the same plaintext must still produce
        // different chunk keys.
        let secret_key = [9u8; KEY_SIZE];
        let d1 = [1u8; 32];
        let d2 = [2u8; 32];
        assert_ne!(xor_key(&secret_key, &d1), xor_key(&secret_key, &d2));
    }
}
