//! KeePass KDBX 3.1 and 4.x import.
//!
//! Once the signature matches, every failure (bad passphrase, tampered
//! block, malformed XML, exceeded limits) is reported as the same
//! authentication error so the file cannot be used as an oracle. The real
//! cause is logged at debug level without any secret material.

mod header;
mod keys;
mod records;
mod stream;
mod xml;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use keyward_common::{Error, Result, SensitiveBytes};

use crate::limits::ImportLimits;
use crate::report::ImportOutcome;

use self::header::{InnerHeader, OuterHeader};
use self::stream::InnerStream;
use self::xml::Node;

pub use self::header::is_kdbx;
pub use self::keys::{MAX_AES_ROUNDS, MAX_ARGON2_MEMORY_BYTES};

/// Import a KDBX database protected by `passphrase`.
///
/// # Errors
/// - `Validation` if the input exceeds the size cap, lacks the KDBX
///   signature, or the passphrase is empty
/// - `Authentication` for every failure after the signature check
pub fn import_kdbx(
    input: &[u8],
    passphrase: &SensitiveBytes,
    limits: &ImportLimits,
) -> Result<ImportOutcome> {
    limits.check_input(input)?;
    if !is_kdbx(input) {
        return Err(Error::Validation("Not a KDBX file".to_string()));
    }
    if passphrase.is_empty() {
        return Err(Error::Validation("Passphrase cannot be empty".to_string()));
    }

    let document = open_document(input, passphrase.as_bytes(), limits).map_err(|e| {
        debug!(error = %e, "KDBX import rejected");
        Error::authentication()
    })?;

    let outcome = records::to_outcome(&document, limits);
    info!(
        imported = outcome.report.imported,
        skipped = outcome.report.skipped,
        errors = outcome.report.errors.len(),
        "KDBX import finished"
    );
    Ok(outcome)
}

fn open_document(input: &[u8], password: &[u8], limits: &ImportLimits) -> Result<Node> {
    let header = OuterHeader::parse(input)?;
    debug!(
        major = header.major,
        minor = header.minor,
        cipher = ?header.cipher,
        compressed = header.compressed,
        "Reading KDBX container"
    );

    let composite = keys::composite_key(password);
    let transformed = keys::transform(&header.kdf, &composite)?;
    let master = keys::master_key(&header.master_seed, &transformed);
    let (header_bytes, body) = input.split_at(header.len);

    if header.major == 3 {
        read_v3(&header, header_bytes, body, &master, limits)
    } else {
        let hmac_base = keys::hmac_base_key(&header.master_seed, &transformed);
        read_v4(&header, header_bytes, body, &master, &hmac_base, limits)
    }
}

fn read_v3(
    header: &OuterHeader,
    header_bytes: &[u8],
    body: &[u8],
    master: &[u8; 32],
    limits: &ImportLimits,
) -> Result<Node> {
    let plain = stream::decrypt_outer(header.cipher, master, &header.encryption_iv, body)?;
    let start = header
        .stream_start_bytes
        .as_deref()
        .ok_or_else(|| Error::Corruption("KDBX header lacks StreamStartBytes".to_string()))?;
    if plain.len() < start.len() || !bool::from(plain[..start.len()].ct_eq(start)) {
        return Err(Error::authentication());
    }

    let payload = stream::read_hashed_blocks(&plain[start.len()..])?;
    let xml_bytes = if header.compressed {
        stream::gunzip_bounded(&payload, limits.max_decompressed_bytes)?
    } else {
        payload
    };

    let stream_key = header
        .protected_stream_key
        .as_ref()
        .ok_or_else(|| Error::Corruption("KDBX header lacks ProtectedStreamKey".to_string()))?;
    let kind = header
        .inner_stream
        .ok_or_else(|| Error::Corruption("KDBX header lacks InnerRandomStreamID".to_string()))?;
    let mut inner = InnerStream::new(kind, stream_key)?;
    let document = xml::parse(&xml_bytes, &mut inner)?;

    if let Some(recorded) = document.child("Meta").and_then(|m| m.child_text("HeaderHash")) {
        let recorded = BASE64
            .decode(recorded.trim())
            .map_err(|_| Error::Corruption("HeaderHash is not base64".to_string()))?;
        if !bool::from(Sha256::digest(header_bytes).as_slice().ct_eq(&recorded)) {
            return Err(Error::Corruption("Header hash mismatch".to_string()));
        }
    }
    Ok(document)
}

fn read_v4(
    header: &OuterHeader,
    header_bytes: &[u8],
    body: &[u8],
    master: &[u8; 32],
    hmac_base: &[u8; 64],
    limits: &ImportLimits,
) -> Result<Node> {
    if body.len() < 64 {
        return Err(Error::Corruption("Truncated KDBX data".to_string()));
    }
    let (checksum, rest) = body.split_at(32);
    let (header_tag, blocks) = rest.split_at(32);

    if !bool::from(Sha256::digest(header_bytes).as_slice().ct_eq(checksum)) {
        return Err(Error::Corruption("Header checksum mismatch".to_string()));
    }
    stream::verify_header_hmac(header_bytes, header_tag, hmac_base)?;

    let encrypted = stream::read_hmac_blocks(blocks, hmac_base)?;
    let plain = stream::decrypt_outer(header.cipher, master, &header.encryption_iv, &encrypted)?;
    let payload = if header.compressed {
        stream::gunzip_bounded(&plain, limits.max_decompressed_bytes)?
    } else {
        plain
    };

    let inner_header = InnerHeader::parse(&payload)?;
    let mut inner = InnerStream::new(inner_header.stream, &inner_header.stream_key)?;
    xml::parse(&payload[inner_header.len..], &mut inner)
}
