// SPDX-FileCopyrightText: 2022-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::atomic::AtomicBool,
};

use memchr::memmem;
use ring::digest::Context;
use rsa::RsaPrivateKey;
use thiserror::Error;
use x509_cert::{Certificate, der::Encode};

use crate::{
    crypto::{self, SignatureAlgorithm},
    stream::{self, HashingWriter, ReadFixedSizeExt},
    util::NumBytes,
};

pub const ZIP_EOCD_MAGIC: &[u8; 4] = b"PK\x05\x06";

/// Size of a non-zip64 EOCD record without the archive comment.
pub const EOCD_SIZE: u64 = 22;

/// Size of the signature footer at the very end of the archive comment.
pub const FOOTER_SIZE: u64 = 6;

const COMMENT_MESSAGE: &[u8] = b"signed by otarecovery\0";

#[derive(Debug, Error)]
pub enum Error {
    #[error("No signature in file (no footer)")]
    OtaMagicNotFound,
    #[error("No signature in file (bad footer)")]
    EocdMagicNotFound,
    #[error("EOCD marker found after start of EOCD")]
    EocdMagicInComment,
    #[error("Zip is too small to contain EOCD")]
    ZipTooSmall,
    #[error("Signature offset {0} is outside of the archive comment")]
    SignatureOffsetOutOfBounds(u16),
    #[error("Archive comment is not empty")]
    CommentNotEmpty,
    #[error("Archive comment contains EOCD magic at offset {0}")]
    CommentContainsMagic(usize),
    #[error("Signature comment is too large: {0:?}")]
    CommentTooLarge(NumBytes<usize>),
    #[error("CMS signing error")]
    CmsSign(#[from] crypto::Error),
    #[error("x509 DER error")]
    Der(#[from] x509_cert::der::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The signature block located at the end of a signapk-style whole-file signed
/// zip, along with what is needed to re-digest the covered data.
#[derive(Clone)]
pub struct OtaSignature {
    /// Raw DER-encoded CMS `SignedData` structure.
    pub block: Vec<u8>,
    /// Size of the archive comment, which contains the signature block.
    pub comment_size: u16,
    /// Number of bytes from the start of the file that are covered by the
    /// signature. This excludes the archive comment and its size field, but
    /// includes everything else, even the rest of the EOCD.
    pub hashed_size: u64,
}

impl fmt::Debug for OtaSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtaSignature")
            .field("block", &NumBytes(self.block.len()))
            .field("comment_size", &self.comment_size)
            .field("hashed_size", &self.hashed_size)
            .finish()
    }
}

/// Locate the CMS signature in the OTA zip comment. This does not perform any
/// parsing of zip data structures aside from the EOCD magic check, so the
/// result does not depend on how lenient a zip parser is.
pub fn parse_ota_sig(mut reader: impl Read + Seek) -> Result<OtaSignature> {
    let file_size = reader.seek(SeekFrom::End(0))?;
    if file_size < FOOTER_SIZE {
        return Err(Error::ZipTooSmall);
    }

    reader.seek(SeekFrom::Start(file_size - FOOTER_SIZE))?;
    let footer = reader.read_array_exact::<6>()?;

    let abs_eoc_offset = u16::from_le_bytes([footer[0], footer[1]]);
    let sig_magic = u16::from_le_bytes([footer[2], footer[3]]);
    let comment_size = u16::from_le_bytes([footer[4], footer[5]]);

    if sig_magic != 0xffff {
        return Err(Error::OtaMagicNotFound);
    }

    // Recovery always assumes a non-zip64 EOCD, so we'll do the same.
    let eocd_size = EOCD_SIZE + u64::from(comment_size);
    if file_size < eocd_size {
        return Err(Error::ZipTooSmall);
    } else if u64::from(abs_eoc_offset) > eocd_size || u64::from(abs_eoc_offset) < FOOTER_SIZE {
        return Err(Error::SignatureOffsetOutOfBounds(abs_eoc_offset));
    }

    reader.seek(SeekFrom::Start(file_size - eocd_size))?;
    let eocd = reader.read_vec_exact(eocd_size as usize)?;

    let mut eocd_magic_iter = memmem::find_iter(&eocd, ZIP_EOCD_MAGIC);
    if eocd_magic_iter.next() != Some(0) {
        return Err(Error::EocdMagicNotFound);
    }
    // A second magic means that the comment could be hiding a forged EOCD
    // that a zip parser would pick up instead of the real one.
    if eocd_magic_iter.next().is_some() {
        return Err(Error::EocdMagicInComment);
    }

    let sig_offset = eocd.len() - usize::from(abs_eoc_offset);
    let block = eocd[sig_offset..eocd.len() - FOOTER_SIZE as usize].to_vec();
    let hashed_size = file_size - 2 - u64::from(comment_size);

    Ok(OtaSignature {
        block,
        comment_size,
        hashed_size,
    })
}

/// Ensure that we're using a non-zip64 EOCD and there's no archive comment.
fn validate_eocd(eocd: &[u8; 22]) -> Result<()> {
    if &eocd[..4] != ZIP_EOCD_MAGIC {
        return Err(Error::EocdMagicNotFound);
    } else if &eocd[20..22] != b"\0\0" {
        return Err(Error::CommentNotEmpty);
    }

    Ok(())
}

/// Compute the digital signature for the specified digest, formatted as a zip
/// file archive comment. The returned buffer includes both the 2-byte comment
/// size field and the comment itself. It should be written to the end of the
/// zip file after truncating the original 2-byte comment size field.
fn compute_signature_comment(
    key: &RsaPrivateKey,
    cert: &Certificate,
    digest: ring::digest::Digest,
) -> Result<Vec<u8>> {
    let cms_signature =
        crypto::cms_sign_external(key, cert, SignatureAlgorithm::Sha256WithRsa, digest.as_ref())?;
    let cms_signature_der = cms_signature.to_der()?;

    // Includes placeholder for the EOCD comment size field.
    let mut buf = vec![0; 2];

    // NULL-terminated readable message and actual signature.
    buf.extend(COMMENT_MESSAGE);
    buf.extend(&cms_signature_der);

    // 6-byte OTA footer.
    let comment_size = buf.len() - 2 + FOOTER_SIZE as usize;
    let Ok(comment_size) = u16::try_from(comment_size) else {
        return Err(Error::CommentTooLarge(NumBytes(comment_size)));
    };

    // Absolute value of the offset of the signature from the end of the archive
    // comment.
    buf.extend((cms_signature_der.len() as u16 + FOOTER_SIZE as u16).to_le_bytes());

    // Magic value.
    buf.extend(b"\xff\xff");

    // Archive comment size (for use by the OTA signature verifier).
    buf.extend(comment_size.to_le_bytes());

    if let Some(o) = memmem::find(&buf[2..], ZIP_EOCD_MAGIC) {
        return Err(Error::CommentContainsMagic(o));
    }

    // Archive comment size (for the EOCD comment size field).
    buf[..2].copy_from_slice(&comment_size.to_le_bytes());

    Ok(buf)
}

/// Produce a signapk-style signed zip from an unsigned zip with an empty
/// archive comment. The whole-file signature is stored in the archive comment
/// and covers everything preceding the comment size field.
pub fn sign_zip(
    mut reader: impl Read + Seek,
    writer: impl Write,
    key: &RsaPrivateKey,
    cert: &Certificate,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let file_size = reader.seek(SeekFrom::End(0))?;
    if file_size < EOCD_SIZE {
        return Err(Error::ZipTooSmall);
    }

    reader.seek(SeekFrom::Start(file_size - EOCD_SIZE))?;
    let eocd = reader.read_array_exact::<22>()?;
    validate_eocd(&eocd)?;

    reader.rewind()?;

    // Chop off the archive comment size field.
    let mut hashing_writer = HashingWriter::new(writer, Context::new(&ring::digest::SHA256));
    stream::copy_n(&mut reader, &mut hashing_writer, file_size - 2, cancel_signal)?;

    let (mut raw_writer, context) = hashing_writer.finish();
    let digest = context.finish();

    let size_and_comment = compute_signature_comment(key, cert, digest)?;
    raw_writer.write_all(&size_and_comment)?;
    raw_writer.flush()?;

    Ok(())
}
