//! kv-pack: a framed, compressed, encrypted, per-file-MAC'd container used
//! to ship the index and catalog as a single archive.
//!
//! Record layout (big-endian), one stream of records per file, terminated
//! by a signature record covering everything since that file's `NEW_FILE`
//! record:
//!
//! ```text
//! NEW_FILE  := length:u32 type:u8=1 name_len:u16 name:[u8; name_len]
//! KV_PAIR   := length:u32 type:u8=2 key_len:u32 value_len:u32 key value
//! SIGNATURE := length:u32 type:u8=3 hmac:[u8; 32]
//! ```
//!
//! `length` is the total size of the record including its own header. The
//! whole record stream is bzip2-compressed and then AES-256-CFB8 encrypted
//! as one contiguous payload — compression happens *before* encryption so
//! that the redundancy between records (repeated key prefixes, similar
//! paths) survives into the compressor; encrypting first would hide it
//! behind pseudorandom ciphertext. The HMAC, by contrast, authenticates
//! only the plaintext records, not their compressed or encrypted form.

use cfb8::cipher::AsyncStreamCipher;
use hmac::Mac;

use crate::crypter::{Crypter, IV_SIZE};
use crate::error::Error;

pub const VERSION_STRING: &[u8; 22] = b"gletscher-kv-pack-v000";

const NEW_FILE: u8 = 1;
const KV_PAIR: u8 = 2;
const SIGNATURE: u8 = 3;

const NEW_FILE_HEADER_LEN: usize = 4 + 1 + 2;
const KV_PAIR_HEADER_LEN: usize = 4 + 1 + 4 + 4;
const SIGNATURE_RECORD_LEN: usize = 4 + 1 + 32;

/// One named file's key/value pairs, as packed or unpacked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvFile {
    pub name: String,
    pub pairs: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Serialize `files` into a kv-pack container.
pub fn pack(crypter: &Crypter, files: &[KvFile]) -> Vec<u8> {
    let mut plaintext = Vec::new();

    for file in files {
        let name_bytes = file.name.as_bytes();
        let mut mac = crypter.new_hmac();

        let mut new_file_record = Vec::with_capacity(NEW_FILE_HEADER_LEN + name_bytes.len());
        new_file_record
            .extend_from_slice(&((NEW_FILE_HEADER_LEN + name_bytes.len()) as u32).to_be_bytes());
        new_file_record.push(NEW_FILE);
        new_file_record.extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
        new_file_record.extend_from_slice(name_bytes);
        mac.update(&new_file_record);
        plaintext.extend_from_slice(&new_file_record);

        for (key, value) in &file.pairs {
            let mut record = Vec::with_capacity(KV_PAIR_HEADER_LEN + key.len() + value.len());
            record.extend_from_slice(
                &((KV_PAIR_HEADER_LEN + key.len() + value.len()) as u32).to_be_bytes(),
            );
            record.push(KV_PAIR);
            record.extend_from_slice(&(key.len() as u32).to_be_bytes());
            record.extend_from_slice(&(value.len() as u32).to_be_bytes());
            record.extend_from_slice(key);
            record.extend_from_slice(value);
            mac.update(&record);
            plaintext.extend_from_slice(&record);
        }

        let digest = mac.finalize().into_bytes();
        let mut signature_record = Vec::with_capacity(SIGNATURE_RECORD_LEN);
        signature_record.extend_from_slice(&(SIGNATURE_RECORD_LEN as u32).to_be_bytes());
        signature_record.push(SIGNATURE);
        signature_record.extend_from_slice(&digest);
        plaintext.extend_from_slice(&signature_record);
    }

    let compressed = bzip2_compress(&plaintext);
    let (iv, cipher) = crypter.new_stream_cipher();
    let mut ciphertext = compressed;
    cipher.encrypt(&mut ciphertext);

    let mut out = Vec::with_capacity(VERSION_STRING.len() + IV_SIZE + ciphertext.len());
    out.extend_from_slice(VERSION_STRING);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out
}

/// Parse and verify a kv-pack container, returning every file it contains.
pub fn unpack(crypter: &Crypter, data: &[u8]) -> Result<Vec<KvFile>, Error> {
    if data.len() < VERSION_STRING.len() + IV_SIZE {
        return Err(Error::CorruptKvPack("stream shorter than header"));
    }
    let (version, rest) = data.split_at(VERSION_STRING.len());
    if version != VERSION_STRING {
        return Err(Error::CorruptKvPack("bad version string"));
    }
    let (iv_bytes, ciphertext) = rest.split_at(IV_SIZE);
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(iv_bytes);

    let cipher = crypter.stream_decryptor(&iv);
    let mut compressed = ciphertext.to_vec();
    cipher.decrypt(&mut compressed);
    let plaintext = decompress_bzip2(&compressed)?;

    parse_records(crypter, &plaintext)
}

fn parse_records(crypter: &Crypter, plaintext: &[u8]) -> Result<Vec<KvFile>, Error> {
    let mut files = Vec::new();
    let mut cursor = 0usize;
    let mut current: Option<(String, Vec<(Vec<u8>, Vec<u8>)>, hmac::Hmac<sha2::Sha256>)> = None;

    while cursor < plaintext.len() {
        if plaintext.len() - cursor < 5 {
            return Err(Error::CorruptKvPack("truncated record header"));
        }
        let length =
            u32::from_be_bytes(plaintext[cursor..cursor + 4].try_into().unwrap()) as usize;
        let record_type = plaintext[cursor + 4];
        if cursor + length > plaintext.len() {
            return Err(Error::CorruptKvPack("record length exceeds stream"));
        }
        let record = &plaintext[cursor..cursor + length];

        match record_type {
            NEW_FILE => {
                if current.is_some() {
                    return Err(Error::CorruptKvPack("new file while previous unsigned"));
                }
                if length < NEW_FILE_HEADER_LEN {
                    return Err(Error::CorruptKvPack("truncated NEW_FILE record"));
                }
                let name_len =
                    u16::from_be_bytes(record[5..7].try_into().unwrap()) as usize;
                if length != NEW_FILE_HEADER_LEN + name_len {
                    return Err(Error::CorruptKvPack("NEW_FILE length mismatch"));
                }
                let name = String::from_utf8(record[7..].to_vec())
                    .map_err(|_| Error::CorruptKvPack("file name is not valid utf-8"))?;
                let mut mac = crypter.new_hmac();
                mac.update(record);
                current = Some((name, Vec::new(), mac));
            }
            KV_PAIR => {
                let (_, pairs, mac) = current
                    .as_mut()
                    .ok_or(Error::CorruptKvPack("KV_PAIR without open file"))?;
                if length < KV_PAIR_HEADER_LEN {
                    return Err(Error::CorruptKvPack("truncated KV_PAIR record"));
                }
                let key_len =
                    u32::from_be_bytes(record[5..9].try_into().unwrap()) as usize;
                let value_len =
                    u32::from_be_bytes(record[9..13].try_into().unwrap()) as usize;
                if length != KV_PAIR_HEADER_LEN + key_len + value_len {
                    return Err(Error::CorruptKvPack("KV_PAIR length mismatch"));
                }
                let key = record[13..13 + key_len].to_vec();
                let value = record[13 + key_len..13 + key_len + value_len].to_vec();
                mac.update(record);
                pairs.push((key, value));
            }
            SIGNATURE => {
                let (name, pairs, mac) = current
                    .take()
                    .ok_or(Error::CorruptKvPack("SIGNATURE without open file"))?;
                if length != SIGNATURE_RECORD_LEN {
                    return Err(Error::CorruptKvPack("bad SIGNATURE record length"));
                }
                let expected = &record[5..];
                let computed = mac.finalize().into_bytes();
                if computed.as_slice() != expected {
                    return Err(Error::CorruptKvPack("signature mismatch"));
                }
                files.push(KvFile { name, pairs });
            }
            _ => return Err(Error::CorruptKvPack("unknown record type")),
        }

        cursor += length;
    }

    if current.is_some() {
        return Err(Error::CorruptKvPack("stream ended before final signature"));
    }
    Ok(files)
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
        .map_err(|_| Error::CorruptKvPack("bzip2 decompression failed"))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypter() -> Crypter {
        Crypter::new([42u8; 32])
    }

    #[test]
    fn round_trips_multiple_files_and_pairs() {
        let files = vec![
            KvFile {
                name: "index".to_string(),
                pairs: vec![
                    (vec![1, 2, 3], vec![4, 5, 6]),
                    (vec![7, 8], b"value-with-some-length".to_vec()),
                ],
            },
            KvFile {
                name: "catalog".to_string(),
                pairs: vec![(b"/etc/hosts".to_vec(), vec![9u8; 16])],
            },
        ];

        let packed = pack(&crypter(), &files);
        assert!(packed.starts_with(VERSION_STRING));
        let unpacked = unpack(&crypter(), &packed).unwrap();
        assert_eq!(unpacked, files);
    }

    #[test]
    fn empty_pack_round_trips_to_no_files() {
        let packed = pack(&crypter(), &[]);
        let unpacked = unpack(&crypter(), &packed).unwrap();
        assert!(unpacked.is_empty());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let files = vec![KvFile {
            name: "index".to_string(),
            pairs: vec![(vec![1], vec![2])],
        }];
        let mut packed = pack(&crypter(), &files);
        let last = packed.len() - 1;
        packed[last] ^= 0xFF;
        // Either the decompressor chokes on the corrupted stream or the
        // signature no longer matches; both are a CorruptKvPack error.
        assert!(unpack(&crypter(), &packed).is_err());
    }

    #[test]
    fn wrong_key_fails_to_unpack() {
        let files = vec![KvFile {
            name: "index".to_string(),
            pairs: vec![(vec![1], vec![2])],
        }];
        let packed = pack(&crypter(), &files);
        let other = Crypter::new([7u8; 32]);
        assert!(unpack(&other, &packed).is_err());
    }

    #[test]
    fn rejects_bad_version_string() {
        let mut packed = pack(&crypter(), &[]);
        packed[0] ^= 0xFF;
        let err = unpack(&crypter(), &packed).unwrap_err();
        assert!(matches!(err, Error::CorruptKvPack(_)));
    }
}
