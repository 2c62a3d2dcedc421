//! Outer header, VariantDictionary and v4 inner header parsing.

use std::collections::BTreeMap;
use zeroize::Zeroizing;

use keyward_common::{Error, Result};

pub const SIGNATURE_1: u32 = 0x9AA2_D903;
pub const SIGNATURE_2: u32 = 0xB54B_FB67;

const CIPHER_AES256: [u8; 16] = [
    0x31, 0xc1, 0xf2, 0xe6, 0xbf, 0x71, 0x43, 0x50, 0xbe, 0x58, 0x05, 0x21, 0x6a, 0xfc, 0x5a, 0xff,
];
const CIPHER_CHACHA20: [u8; 16] = [
    0xd6, 0x03, 0x8a, 0x2b, 0x8b, 0x6f, 0x4c, 0xb5, 0xa5, 0x24, 0x33, 0x9a, 0x31, 0xdb, 0xb5, 0x9a,
];
const KDF_AES: [u8; 16] = [
    0xc9, 0xd9, 0xf3, 0x9a, 0x62, 0x8a, 0x44, 0x60, 0xbf, 0x74, 0x0d, 0x08, 0xc1, 0x8a, 0x4f, 0xea,
];
const KDF_ARGON2D: [u8; 16] = [
    0xef, 0x63, 0x6d, 0xdf, 0x8c, 0x29, 0x44, 0x4b, 0x91, 0xf7, 0xa9, 0xa4, 0x03, 0xe3, 0x0a, 0x0c,
];
const KDF_ARGON2ID: [u8; 16] = [
    0x9e, 0x29, 0x8b, 0x19, 0x56, 0xdb, 0x47, 0x73, 0xb2, 0x3d, 0xfc, 0x3e, 0xc6, 0xf0, 0xa1, 0xe6,
];

/// Whether `input` starts with the KDBX signature.
pub fn is_kdbx(input: &[u8]) -> bool {
    let mut reader = ByteReader::new(input);
    matches!(
        (reader.u32(), reader.u32()),
        (Ok(SIGNATURE_1), Ok(SIGNATURE_2))
    )
}

/// Bounds-checked little-endian reader.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| Error::Corruption("Truncated KDBX data".to_string()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    /// A length prefix that must not be negative.
    pub(crate) fn length(&mut self) -> Result<usize> {
        usize::try_from(self.i32()?)
            .map_err(|_| Error::Corruption("Negative length in KDBX data".to_string()))
    }
}

/// Outer payload cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OuterCipher {
    Aes256Cbc,
    ChaCha20,
}

/// Argon2 flavour named by the KDF UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Argon2Variant {
    D,
    Id,
}

/// Key transformation recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum KdfConfig {
    Aes {
        seed: Vec<u8>,
        rounds: u64,
    },
    Argon2 {
        variant: Argon2Variant,
        salt: Vec<u8>,
        memory_bytes: u64,
        iterations: u64,
        parallelism: u32,
        version: u32,
    },
}

/// Cipher generating the keystream for protected XML values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InnerStreamKind {
    None,
    Salsa20,
    ChaCha20,
}

impl InnerStreamKind {
    fn from_id(id: u32) -> Result<Self> {
        match id {
            0 => Ok(Self::None),
            2 => Ok(Self::Salsa20),
            3 => Ok(Self::ChaCha20),
            other => Err(Error::Validation(format!(
                "Unsupported inner stream cipher {}",
                other
            ))),
        }
    }
}

/// Parsed outer header.
pub(crate) struct OuterHeader {
    pub major: u16,
    pub minor: u16,
    pub cipher: OuterCipher,
    pub compressed: bool,
    pub master_seed: Vec<u8>,
    pub encryption_iv: Vec<u8>,
    pub kdf: KdfConfig,
    /// v3 only.
    pub protected_stream_key: Option<Zeroizing<Vec<u8>>>,
    /// v3 only.
    pub stream_start_bytes: Option<Vec<u8>>,
    /// v3 only.
    pub inner_stream: Option<InnerStreamKind>,
    /// Length of the header including the end-of-header field.
    pub len: usize,
}

impl OuterHeader {
    pub(crate) fn parse(input: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(input);
        if reader.u32()? != SIGNATURE_1 || reader.u32()? != SIGNATURE_2 {
            return Err(Error::Validation("Not a KDBX file".to_string()));
        }
        let minor = reader.u16()?;
        let major = reader.u16()?;
        if major != 3 && major != 4 {
            return Err(Error::Validation(format!(
                "Unsupported KDBX version {}.{}",
                major, minor
            )));
        }

        let mut cipher = None;
        let mut compressed = false;
        let mut master_seed = None;
        let mut encryption_iv = None;
        let mut transform_seed = None;
        let mut transform_rounds = None;
        let mut kdf = None;
        let mut protected_stream_key = None;
        let mut stream_start_bytes = None;
        let mut inner_stream = None;

        loop {
            let id = reader.u8()?;
            let size = if major == 3 {
                reader.u16()? as usize
            } else {
                reader.u32()? as usize
            };
            let data = reader.bytes(size)?;
            match id {
                0 => break,
                2 => cipher = Some(parse_cipher(data)?),
                3 => {
                    compressed = match le_u32(data)? {
                        0 => false,
                        1 => true,
                        other => {
                            return Err(Error::Validation(format!(
                                "Unknown compression flag {}",
                                other
                            )))
                        }
                    }
                }
                4 => master_seed = Some(data.to_vec()),
                5 => transform_seed = Some(data.to_vec()),
                6 => transform_rounds = Some(le_u64(data)?),
                7 => encryption_iv = Some(data.to_vec()),
                8 => protected_stream_key = Some(Zeroizing::new(data.to_vec())),
                9 => stream_start_bytes = Some(data.to_vec()),
                10 => inner_stream = Some(InnerStreamKind::from_id(le_u32(data)?)?),
                11 => kdf = Some(parse_kdf(&VariantDictionary::parse(data)?)?),
                _ => {}
            }
        }

        if major == 3 {
            kdf = Some(KdfConfig::Aes {
                seed: missing(transform_seed, "TransformSeed")?,
                rounds: missing(transform_rounds, "TransformRounds")?,
            });
        }

        let master_seed = missing(master_seed, "MasterSeed")?;
        if master_seed.len() != 32 {
            return Err(Error::Corruption("MasterSeed must be 32 bytes".to_string()));
        }

        Ok(Self {
            major,
            minor,
            cipher: missing(cipher, "CipherID")?,
            compressed,
            master_seed,
            encryption_iv: missing(encryption_iv, "EncryptionIV")?,
            kdf: missing(kdf, "KdfParameters")?,
            protected_stream_key,
            stream_start_bytes,
            inner_stream,
            len: reader.position(),
        })
    }
}

fn missing<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| Error::Corruption(format!("KDBX header lacks {}", field)))
}

fn le_u32(data: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = data
        .try_into()
        .map_err(|_| Error::Corruption("Expected a 4-byte field".to_string()))?;
    Ok(u32::from_le_bytes(bytes))
}

fn le_u64(data: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = data
        .try_into()
        .map_err(|_| Error::Corruption("Expected an 8-byte field".to_string()))?;
    Ok(u64::from_le_bytes(bytes))
}

fn parse_cipher(data: &[u8]) -> Result<OuterCipher> {
    if data == CIPHER_AES256 {
        Ok(OuterCipher::Aes256Cbc)
    } else if data == CIPHER_CHACHA20 {
        Ok(OuterCipher::ChaCha20)
    } else {
        Err(Error::Validation("Unsupported KDBX cipher".to_string()))
    }
}

/// Typed value in a VariantDictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Variant {
    U32(u32),
    U64(u64),
    Bool(bool),
    I32(i32),
    I64(i64),
    Str(String),
    Bytes(Vec<u8>),
}

/// Key/value map used for KDF parameters and public custom data.
#[derive(Debug, Default)]
pub(crate) struct VariantDictionary {
    items: BTreeMap<String, Variant>,
}

impl VariantDictionary {
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let version = reader.u16()?;
        if version & 0xFF00 != 0x0100 {
            return Err(Error::Validation(format!(
                "Unsupported VariantDictionary version {:#06x}",
                version
            )));
        }

        let mut items = BTreeMap::new();
        loop {
            let kind = reader.u8()?;
            if kind == 0 {
                break;
            }
            let key_len = reader.length()?;
            let key = String::from_utf8(reader.bytes(key_len)?.to_vec())
                .map_err(|_| Error::Corruption("VariantDictionary key is not UTF-8".to_string()))?;
            let value_len = reader.length()?;
            let value = reader.bytes(value_len)?;

            let variant = match kind {
                0x04 => Variant::U32(le_u32(value)?),
                0x05 => Variant::U64(le_u64(value)?),
                0x08 => Variant::Bool(value.first().is_some_and(|b| *b != 0)),
                0x0C => Variant::I32(le_u32(value)? as i32),
                0x0D => Variant::I64(le_u64(value)? as i64),
                0x18 => Variant::Str(String::from_utf8_lossy(value).into_owned()),
                0x42 => Variant::Bytes(value.to_vec()),
                other => {
                    return Err(Error::Corruption(format!(
                        "Unknown VariantDictionary type {:#04x}",
                        other
                    )))
                }
            };
            items.insert(key, variant);
        }
        Ok(Self { items })
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Variant> {
        self.items.get(key)
    }

    fn bytes(&self, key: &str) -> Result<&[u8]> {
        match self.get(key) {
            Some(Variant::Bytes(bytes)) => Ok(bytes),
            _ => Err(Error::Corruption(format!("KDF parameter {} missing", key))),
        }
    }

    fn uint(&self, key: &str) -> Result<u64> {
        match self.get(key) {
            Some(Variant::U32(v)) => Ok(u64::from(*v)),
            Some(Variant::U64(v)) => Ok(*v),
            _ => Err(Error::Corruption(format!("KDF parameter {} missing", key))),
        }
    }
}

fn parse_kdf(dict: &VariantDictionary) -> Result<KdfConfig> {
    let uuid = dict.bytes("$UUID")?;
    if uuid == KDF_AES {
        return Ok(KdfConfig::Aes {
            seed: dict.bytes("S")?.to_vec(),
            rounds: dict.uint("R")?,
        });
    }

    let variant = if uuid == KDF_ARGON2D {
        Argon2Variant::D
    } else if uuid == KDF_ARGON2ID {
        Argon2Variant::Id
    } else {
        return Err(Error::Validation("Unsupported KDBX key derivation".to_string()));
    };

    let parallelism = u32::try_from(dict.uint("P")?)
        .map_err(|_| Error::Validation("Argon2 parallelism out of range".to_string()))?;
    let version = match dict.get("V") {
        None => 0x13,
        Some(_) => u32::try_from(dict.uint("V")?)
            .map_err(|_| Error::Validation("Argon2 version out of range".to_string()))?,
    };

    Ok(KdfConfig::Argon2 {
        variant,
        salt: dict.bytes("S")?.to_vec(),
        memory_bytes: dict.uint("M")?,
        iterations: dict.uint("I")?,
        parallelism,
        version,
    })
}

/// Fields of the KDBX 4 inner header.
pub(crate) struct InnerHeader {
    pub stream: InnerStreamKind,
    pub stream_key: Zeroizing<Vec<u8>>,
    /// Offset of the XML document in the decrypted payload.
    pub len: usize,
}

impl InnerHeader {
    pub(crate) fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(payload);
        let mut stream = None;
        let mut stream_key = None;

        loop {
            let id = reader.u8()?;
            let size = reader.length()?;
            let data = reader.bytes(size)?;
            match id {
                0 => break,
                1 => stream = Some(InnerStreamKind::from_id(le_u32(data)?)?),
                2 => stream_key = Some(Zeroizing::new(data.to_vec())),
                // Attachments are not imported.
                _ => {}
            }
        }

        Ok(Self {
            stream: missing(stream, "InnerRandomStreamID")?,
            stream_key: missing(stream_key, "InnerRandomStreamKey")?,
            len: reader.position(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dictionary(items: &[(u8, &str, &[u8])]) -> Vec<u8> {
        let mut out = 0x0100u16.to_le_bytes().to_vec();
        for (kind, key, value) in items {
            out.push(*kind);
            out.extend_from_slice(&(key.len() as i32).to_le_bytes());
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(&(value.len() as i32).to_le_bytes());
            out.extend_from_slice(value);
        }
        out.push(0);
        out
    }

    #[test]
    fn test_signature_detection() {
        let mut input = SIGNATURE_1.to_le_bytes().to_vec();
        input.extend_from_slice(&SIGNATURE_2.to_le_bytes());
        assert!(is_kdbx(&input));
        assert!(!is_kdbx(b"title,username\n"));
        assert!(!is_kdbx(&input[..6]));
    }

    #[test]
    fn test_argon2_parameters() {
        let data = dictionary(&[
            (0x42, "$UUID", &KDF_ARGON2ID),
            (0x05, "I", &3u64.to_le_bytes()),
            (0x05, "M", &(64u64 * 1024 * 1024).to_le_bytes()),
            (0x04, "P", &2u32.to_le_bytes()),
            (0x42, "S", &[7u8; 32]),
            (0x04, "V", &0x13u32.to_le_bytes()),
        ]);
        let kdf = parse_kdf(&VariantDictionary::parse(&data).unwrap()).unwrap();
        assert_eq!(
            kdf,
            KdfConfig::Argon2 {
                variant: Argon2Variant::Id,
                salt: vec![7u8; 32],
                memory_bytes: 64 * 1024 * 1024,
                iterations: 3,
                parallelism: 2,
                version: 0x13,
            }
        );
    }

    #[test]
    fn test_unknown_kdf_is_rejected() {
        let data = dictionary(&[(0x42, "$UUID", &[0u8; 16])]);
        assert!(parse_kdf(&VariantDictionary::parse(&data).unwrap()).is_err());
    }

    #[test]
    fn test_truncated_dictionary() {
        let mut data = dictionary(&[(0x05, "R", &1000u64.to_le_bytes())]);
        data.truncate(data.len() - 4);
        assert!(VariantDictionary::parse(&data).is_err());
    }

    #[test]
    fn test_inner_header() {
        let mut payload = Vec::new();
        payload.push(1);
        payload.extend_from_slice(&4i32.to_le_bytes());
        payload.extend_from_slice(&3u32.to_le_bytes());
        payload.push(2);
        payload.extend_from_slice(&64i32.to_le_bytes());
        payload.extend_from_slice(&[9u8; 64]);
        payload.push(0);
        payload.extend_from_slice(&0i32.to_le_bytes());
        payload.extend_from_slice(b"<KeePassFile/>");

        let inner = InnerHeader::parse(&payload).unwrap();
        assert_eq!(inner.stream, InnerStreamKind::ChaCha20);
        assert_eq!(inner.stream_key.as_slice(), &[9u8; 64][..]);
        assert_eq!(&payload[inner.len..], b"<KeePassFile/>");
    }

    #[test]
    fn test_reader_rejects_oversized_length() {
        let mut reader = ByteReader::new(&[1, 2, 3]);
        assert!(reader.bytes(4).is_err());
        assert_eq!(reader.bytes(3).unwrap(), &[1, 2, 3]);
        assert_eq!(reader.position(), 3);
    }
}
