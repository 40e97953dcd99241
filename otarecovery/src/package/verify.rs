// SPDX-FileCopyrightText: 2022-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Read, Seek},
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use cms::signed_data::SignerInfo;
use const_oid::{ObjectIdentifier, db::rfc5912};
use ring::digest::Context;
use thiserror::Error;
use tracing::{debug, trace};
use x509_cert::Certificate;

use crate::{
    crypto::{self, RsaPublicKeyExt, SignatureAlgorithm},
    format::ota::{self, OtaSignature},
    package::{
        compat::{self, CompatibilityChecker},
        keystore,
    },
    progress::{self, PUBLISH_PROGRESS_INTERVAL, ProgressThrottle},
    stream::{self, HashingReader},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to locate package signature")]
    Format(#[from] ota::Error),
    #[error("Failed to parse signature block")]
    SignatureBlock(#[source] crypto::Error),
    #[error("Signature contains no {0}")]
    NoSignature(&'static str),
    #[error("Signature doesn't match any trusted key")]
    UntrustedSignature,
    #[error("Unsupported {0} algorithm: {1}")]
    UnsupportedAlgorithm(&'static str, ObjectIdentifier),
    #[error("Signing certificate has an invalid public key")]
    InvalidPublicKey(#[source] crypto::Error),
    #[error("Signature digest verification failed")]
    DigestMismatch(#[source] crypto::Error),
    #[error("Verification was interrupted")]
    Interrupted,
    #[error("Package is incompatible with the running system")]
    Incompatible,
    #[error("Failed to load trusted certificates")]
    Keystore(#[from] keystore::Error),
    #[error("Failed to verify package compatibility")]
    Compatibility(#[from] compat::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error means that the package signature is missing or
    /// invalid. Callers should treat all of these the same way and only use the
    /// specific variant for diagnostics.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            Self::Format(_)
                | Self::SignatureBlock(_)
                | Self::NoSignature(_)
                | Self::UntrustedSignature
                | Self::UnsupportedAlgorithm(_, _)
                | Self::InvalidPublicKey(_)
                | Self::DigestMismatch(_)
        )
    }
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug)]
pub struct VerifyOptions {
    /// Keystore zip containing the trusted certificates. The system keystore is
    /// used if unset.
    pub keystore: Option<PathBuf>,
    /// Minimum time between progress reports, excluding 0% and 100%.
    pub progress_interval: Duration,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            keystore: None,
            progress_interval: PUBLISH_PROGRESS_INTERVAL,
        }
    }
}

/// An OTA package with a located and decoded whole-file signature. No part of
/// the signature has been verified yet.
pub struct SignedPackage<R> {
    reader: R,
    signature: OtaSignature,
    cert: Certificate,
    signer: SignerInfo,
}

impl<R: Read + Seek> SignedPackage<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let signature = ota::parse_ota_sig(&mut reader)?;
        let signed_data = crypto::parse_cms(&signature.block).map_err(Error::SignatureBlock)?;

        // Only the first certificate and signer are considered.
        let cert = crypto::iter_cms_certs(&signed_data)
            .next()
            .cloned()
            .ok_or(Error::NoSignature("certificates"))?;
        let signer = signed_data
            .signer_infos
            .0
            .get(0)
            .cloned()
            .ok_or(Error::NoSignature("signer info"))?;

        debug!("Found signature: {signature:?}");

        Ok(Self {
            reader,
            signature,
            cert,
            signer,
        })
    }

    /// The certificate whose public key is used to verify the package.
    pub fn signing_cert(&self) -> &Certificate {
        &self.cert
    }

    pub fn signature(&self) -> &OtaSignature {
        &self.signature
    }

    /// Verify the package signature against the trusted certificates. The
    /// digest is computed over the whole file, excluding the archive comment
    /// and its size field.
    ///
    /// `on_progress` is called with 0 before any data is read, with increasing
    /// percentages at most once per `interval` while hashing, and with 100 on
    /// completion. If `cancel_signal` is set while hashing, the signal is
    /// cleared and [`Error::Interrupted`] is returned without reporting 100.
    pub fn verify(
        &mut self,
        trusted: &[Certificate],
        interval: Duration,
        mut on_progress: impl FnMut(u8),
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        let cert = &self.cert;

        // Only the public key matters. Trusted certificates may be expired or
        // have a different subject.
        if !trusted.iter().any(|t| crypto::same_public_key(t, cert)) {
            return Err(Error::UntrustedSignature);
        }

        let public_key = crypto::get_public_key(cert).map_err(Error::InvalidPublicKey)?;

        let signer = &self.signer;
        let algo = SignatureAlgorithm::from_digest_oid(signer.digest_alg.oid)
            .ok_or(Error::UnsupportedAlgorithm("digest", signer.digest_alg.oid))?;

        match signer.signature_algorithm.oid {
            rfc5912::RSA_ENCRYPTION
            | rfc5912::SHA_1_WITH_RSA_ENCRYPTION
            | rfc5912::SHA_256_WITH_RSA_ENCRYPTION
            | rfc5912::SHA_512_WITH_RSA_ENCRYPTION => {}
            oid => return Err(Error::UnsupportedAlgorithm("signature", oid)),
        }

        let signature = signer.signature.as_bytes().to_vec();
        let to_read = self.signature.hashed_size;

        self.reader.rewind()?;

        let mut hashing_reader =
            HashingReader::new(&mut self.reader, Context::new(algo.ring_algorithm()));
        let mut throttle = ProgressThrottle::new(interval);

        on_progress(0);

        let n = stream::read_n_until_cancel(
            &mut hashing_reader,
            to_read,
            |so_far| {
                let percent = progress::percent(so_far, to_read);

                // 100% is only reported once the whole digest is known.
                if percent < 100 && throttle.update(percent) {
                    on_progress(percent);
                }
            },
            cancel_signal,
        )?;

        // The signal may also have been raised during the last read.
        if cancel_signal.swap(false, Ordering::SeqCst) {
            debug!("Verification interrupted after {n} of {to_read} bytes");
            return Err(Error::Interrupted);
        }

        on_progress(100);

        let (_, context) = hashing_reader.finish();
        let digest = context.finish();
        trace!("Package digest: {}", hex::encode(digest.as_ref()));

        public_key
            .verify_sig(algo, digest.as_ref(), &signature)
            .map_err(Error::DigestMismatch)?;

        Ok(())
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Verify that an OTA package was signed by a trusted key and that it is
/// compatible with the running system. The trusted certificates are loaded from
/// the keystore on every call. Returns the signing certificate.
pub fn verify_package(
    reader: impl Read + Seek,
    options: &VerifyOptions,
    checker: &(impl CompatibilityChecker + ?Sized),
    on_progress: impl FnMut(u8),
    cancel_signal: &AtomicBool,
) -> Result<Certificate> {
    let mut package = SignedPackage::new(reader)?;

    let trusted = keystore::load_trusted_certs(options.keystore.as_deref())?;

    package.verify(&trusted, options.progress_interval, on_progress, cancel_signal)?;

    let cert = package.signing_cert().clone();

    if !compat::verify_package_compatibility(package.into_inner(), checker)? {
        return Err(Error::Incompatible);
    }

    Ok(cert)
}
