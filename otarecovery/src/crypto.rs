// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    env::{self, VarError},
    ffi::OsString,
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    time::Duration,
};

use cms::{
    cert::{CertificateChoices, IssuerAndSerialNumber},
    content_info::{CmsVersion, ContentInfo},
    signed_data::{
        CertificateSet, DigestAlgorithmIdentifiers, EncapsulatedContentInfo, SignatureValue,
        SignedData, SignerIdentifier, SignerInfo, SignerInfos,
    },
};
use const_oid::{ObjectIdentifier, db::rfc5912};
use pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey, pkcs1v15::SigningKey, traits::PublicKeyParts};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use x509_cert::{
    Certificate,
    builder::{Builder, CertificateBuilder, Profile},
    der::{Any, Decode, DecodePem, referenced::OwnedToRef},
    serial_number::SerialNumber,
    spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned},
    time::Validity,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Signature algorithm not supported: {0:?}")]
    UnsupportedAlgorithm(SignatureAlgorithm),
    #[error("RSA key size ({}) not supported", .0 * 8)]
    UnsupportedKeySize(usize),
    #[error("Invalid digest length ({0} bytes) for {1:?}")]
    InvalidDigestLength(usize, SignatureAlgorithm),
    #[error("Failed to read environment variable: {0:?}")]
    InvalidEnvVar(OsString, #[source] VarError),
    #[error("PEM has start tag, but no end tag")]
    PemNoEndTag,
    #[error("Failed to load encrypted RSA private key")]
    LoadKeyEncrypted(#[source] pkcs8::Error),
    #[error("Failed to load unencrypted RSA private key")]
    LoadKeyUnencrypted(#[source] pkcs8::Error),
    #[error("Failed to load RSA public key")]
    LoadPubKey(#[source] pkcs8::spki::Error),
    #[error("Failed to save RSA public key")]
    SavePubKey(#[source] pkcs8::spki::Error),
    #[error("Failed to load X509 certificate")]
    LoadCert(#[source] x509_cert::der::Error),
    #[error("Failed to generate RSA key")]
    RsaGenerate(#[source] Box<rsa::Error>),
    #[error("Failed to RSA sign digest")]
    RsaSign(#[source] Box<rsa::Error>),
    #[error("Failed to RSA verify signature")]
    RsaVerify(#[source] Box<rsa::Error>),
    #[error("Failed to generate X509 certificate")]
    CertGenerate(#[source] x509_cert::builder::Error),
    #[error("Invalid parameters for X509 certificate generation")]
    CertParams(#[source] x509_cert::der::Error),
    #[error("Failed to CMS sign digest")]
    CmsSign(#[source] x509_cert::der::Error),
    #[error("Failed to parse CMS signature")]
    CmsParse(#[source] x509_cert::der::Error),
    #[error("Failed to read file: {0:?}")]
    ReadFile(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignatureAlgorithm {
    Sha1WithRsa,
    Sha256WithRsa,
    Sha512WithRsa,
}

impl SignatureAlgorithm {
    /// Map a CMS `SignerInfo` digest algorithm OID to the corresponding RSA
    /// signature algorithm.
    pub fn from_digest_oid(oid: ObjectIdentifier) -> Option<Self> {
        match oid {
            rfc5912::ID_SHA_1 => Some(Self::Sha1WithRsa),
            rfc5912::ID_SHA_256 => Some(Self::Sha256WithRsa),
            rfc5912::ID_SHA_512 => Some(Self::Sha512WithRsa),
            _ => None,
        }
    }

    /// Length of digest required by the signing algorithm.
    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha1WithRsa => Sha1::output_size(),
            Self::Sha256WithRsa => Sha256::output_size(),
            Self::Sha512WithRsa => Sha512::output_size(),
        }
    }

    /// The ring digest algorithm for hashing large inputs.
    pub fn ring_algorithm(self) -> &'static ring::digest::Algorithm {
        match self {
            Self::Sha1WithRsa => &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
            Self::Sha256WithRsa => &ring::digest::SHA256,
            Self::Sha512WithRsa => &ring::digest::SHA512,
        }
    }

    fn digest_oid(self) -> ObjectIdentifier {
        match self {
            Self::Sha1WithRsa => rfc5912::ID_SHA_1,
            Self::Sha256WithRsa => rfc5912::ID_SHA_256,
            Self::Sha512WithRsa => rfc5912::ID_SHA_512,
        }
    }

    fn signature_oid(self) -> ObjectIdentifier {
        match self {
            Self::Sha1WithRsa => rfc5912::SHA_1_WITH_RSA_ENCRYPTION,
            Self::Sha256WithRsa => rfc5912::SHA_256_WITH_RSA_ENCRYPTION,
            Self::Sha512WithRsa => rfc5912::SHA_512_WITH_RSA_ENCRYPTION,
        }
    }
}

/// Where to obtain the passphrase for an encrypted private key. There is no
/// interactive prompt because this is only used for tooling.
#[derive(Clone, Debug)]
pub enum PassphraseSource {
    None,
    EnvVar(OsString),
    File(PathBuf),
}

impl PassphraseSource {
    pub fn acquire(&self) -> Result<Option<String>> {
        let passphrase = match self {
            Self::None => return Ok(None),
            Self::EnvVar(v) => env::var(v).map_err(|e| Error::InvalidEnvVar(v.clone(), e))?,
            Self::File(p) => fs::read_to_string(p)
                .map_err(|e| Error::ReadFile(p.clone(), e))?
                .trim_end_matches(['\r', '\n'])
                .to_owned(),
        };

        Ok(Some(passphrase))
    }
}

fn check_key_size(size: usize) -> Result<()> {
    // RustCrypto does not support 8192-bit keys.
    if size > 4096 / 8 {
        return Err(Error::UnsupportedKeySize(size));
    }

    Ok(())
}

fn pkcs1v15_scheme(algo: SignatureAlgorithm) -> Pkcs1v15Sign {
    match algo {
        SignatureAlgorithm::Sha1WithRsa => Pkcs1v15Sign::new::<Sha1>(),
        SignatureAlgorithm::Sha256WithRsa => Pkcs1v15Sign::new::<Sha256>(),
        SignatureAlgorithm::Sha512WithRsa => Pkcs1v15Sign::new::<Sha512>(),
    }
}

pub trait RsaPublicKeyExt {
    fn verify_sig(&self, algo: SignatureAlgorithm, digest: &[u8], signature: &[u8]) -> Result<()>;
}

impl RsaPublicKeyExt for RsaPublicKey {
    /// Verify the signature against the specified key.
    fn verify_sig(&self, algo: SignatureAlgorithm, digest: &[u8], signature: &[u8]) -> Result<()> {
        // Check this explicitly so we can provide a better error message.
        if digest.len() != algo.digest_len() {
            return Err(Error::InvalidDigestLength(digest.len(), algo));
        }

        check_key_size(self.size())?;

        self.verify(pkcs1v15_scheme(algo), digest, signature)
            .map_err(|e| Error::RsaVerify(Box::new(e)))
    }
}

/// Sign a digest with PKCS#1 v1.5 padding.
pub fn rsa_sign(key: &RsaPrivateKey, algo: SignatureAlgorithm, digest: &[u8]) -> Result<Vec<u8>> {
    if digest.len() != algo.digest_len() {
        return Err(Error::InvalidDigestLength(digest.len(), algo));
    }

    check_key_size(key.size())?;

    // We don't support signing with insecure algorithms.
    if algo == SignatureAlgorithm::Sha1WithRsa {
        return Err(Error::UnsupportedAlgorithm(algo));
    }

    key.sign(pkcs1v15_scheme(algo), digest)
        .map_err(|e| Error::RsaSign(Box::new(e)))
}

/// Generate an RSA key pair of the given size.
pub fn generate_rsa_key_pair(bits: usize) -> Result<RsaPrivateKey> {
    let mut rng = rand::thread_rng();

    let key = RsaPrivateKey::new(&mut rng, bits).map_err(|e| Error::RsaGenerate(Box::new(e)))?;

    Ok(key)
}

/// Generate a self-signed certificate.
pub fn generate_cert(
    key: &RsaPrivateKey,
    serial: u64,
    validity: Duration,
    subject: &str,
) -> Result<Certificate> {
    let public_key_der = key
        .to_public_key()
        .to_public_key_der()
        .map_err(Error::SavePubKey)?;
    let signing_key = SigningKey::<Sha256>::new(key.clone());

    let builder = CertificateBuilder::new(
        Profile::Root,
        SerialNumber::from(serial),
        Validity::from_now(validity).map_err(Error::CertParams)?,
        subject.parse().map_err(Error::CertParams)?,
        SubjectPublicKeyInfoOwned::from_der(public_key_der.as_bytes())
            .map_err(Error::CertParams)?,
        &signing_key,
    )
    .map_err(Error::CertGenerate)?;

    let mut rng = rand::thread_rng();
    let cert = builder
        .build_with_rng(&mut rng)
        .map_err(Error::CertGenerate)?;

    Ok(cert)
}

/// x509_cert/pem follow rfc7468 strictly instead of implementing a lenient
/// parser. The PEM decoder rejects lines in the base64 section that are longer
/// than 64 characters, excluding whitespace. We'll reformat the data to deal
/// with this because there are certificates that do not follow the spec, like
/// the signing cert for the Pixel 7 Pro official OTAs.
fn reformat_pem(data: &[u8]) -> Result<Vec<u8>> {
    let mut result = vec![];
    let mut base64 = vec![];
    let mut inside_base64 = false;

    for mut line in data.split(|&c| c == b'\n') {
        while !line.is_empty() && line[line.len() - 1].is_ascii_whitespace() {
            line = &line[..line.len() - 1];
        }

        if line.is_empty() {
            continue;
        } else if line.starts_with(b"-----BEGIN CERTIFICATE-----") {
            inside_base64 = true;

            result.extend_from_slice(line);
            result.push(b'\n');
        } else if line.starts_with(b"-----END CERTIFICATE-----") {
            inside_base64 = false;

            for chunk in base64.chunks(64) {
                result.extend_from_slice(chunk);
                result.push(b'\n');
            }

            base64.clear();

            result.extend_from_slice(line);
            result.push(b'\n');
        } else if inside_base64 {
            base64.extend_from_slice(line);
            continue;
        }
    }

    if inside_base64 {
        return Err(Error::PemNoEndTag);
    }

    Ok(result)
}

/// Decode a certificate that is either DER-encoded or PEM-encoded. The
/// platform certificate factory accepts both, so keystores in the wild contain
/// both.
pub fn decode_cert(data: &[u8]) -> Result<Certificate> {
    let trimmed = data.trim_ascii_start();

    if trimmed.starts_with(b"-----BEGIN") {
        let data = reformat_pem(trimmed)?;
        Certificate::from_pem(data).map_err(Error::LoadCert)
    } else {
        Certificate::from_der(data).map_err(Error::LoadCert)
    }
}

/// Read a DER or PEM encoded certificate from a reader.
pub fn read_cert(path: &Path, mut reader: impl Read) -> Result<Certificate> {
    let mut data = vec![];
    reader
        .read_to_end(&mut data)
        .map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    decode_cert(&data)
}

/// Read a DER or PEM encoded certificate from a file.
pub fn read_cert_file(path: &Path) -> Result<Certificate> {
    let reader = File::open(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    read_cert(path, reader)
}

/// Read PEM-encoded PKCS8 private key from a file.
pub fn read_pem_key_file(path: &Path, source: &PassphraseSource) -> Result<RsaPrivateKey> {
    let data = fs::read_to_string(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    if data.contains("ENCRYPTED") {
        let passphrase = source.acquire()?.unwrap_or_default();

        RsaPrivateKey::from_pkcs8_encrypted_pem(&data, passphrase).map_err(Error::LoadKeyEncrypted)
    } else {
        RsaPrivateKey::from_pkcs8_pem(&data).map_err(Error::LoadKeyUnencrypted)
    }
}

/// Get the RSA public key from a certificate.
pub fn get_public_key(cert: &Certificate) -> Result<RsaPublicKey> {
    let public_key =
        RsaPublicKey::try_from(cert.tbs_certificate.subject_public_key_info.owned_to_ref())
            .map_err(Error::LoadPubKey)?;

    Ok(public_key)
}

/// Check if two certificates carry the same public key. Nothing else about the
/// certificates is compared.
pub fn same_public_key(a: &Certificate, b: &Certificate) -> bool {
    a.tbs_certificate.subject_public_key_info == b.tbs_certificate.subject_public_key_info
}

/// Parse a CMS [`SignedData`] structure from raw DER-encoded data.
pub fn parse_cms(data: &[u8]) -> Result<SignedData> {
    let ci = ContentInfo::from_der(data).map_err(Error::CmsParse)?;
    let sd = ci
        .content
        .decode_as::<SignedData>()
        .map_err(Error::CmsParse)?;

    Ok(sd)
}

/// Get an iterator to all standard X509 certificates contained within a
/// [`SignedData`] structure.
pub fn iter_cms_certs(sd: &SignedData) -> impl Iterator<Item = &Certificate> {
    sd.certificates.iter().flat_map(|certs| {
        certs.0.iter().filter_map(|cc| {
            if let CertificateChoices::Certificate(c) = cc {
                Some(c)
            } else {
                None
            }
        })
    })
}

/// Create a CMS signature from an external digest. This does not use signed
/// attributes because recovery's verifier is not actually CMS compliant. It
/// simply uses the CMS [`SignedData`] structure as a transport mechanism for a
/// raw signature, so the signature must cover nothing but the raw data.
pub fn cms_sign_external(
    key: &RsaPrivateKey,
    cert: &Certificate,
    algo: SignatureAlgorithm,
    digest: &[u8],
) -> Result<ContentInfo> {
    let signature = rsa_sign(key, algo, digest)?;

    let digest_algorithm = AlgorithmIdentifierOwned {
        oid: algo.digest_oid(),
        parameters: None,
    };

    let signed_data = SignedData {
        version: CmsVersion::V1,
        digest_algorithms: DigestAlgorithmIdentifiers::try_from(vec![digest_algorithm.clone()])
            .map_err(Error::CmsSign)?,
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: const_oid::db::rfc5911::ID_DATA,
            econtent: None,
        },
        certificates: Some(
            CertificateSet::try_from(vec![CertificateChoices::Certificate(cert.clone())])
                .map_err(Error::CmsSign)?,
        ),
        crls: None,
        signer_infos: SignerInfos::try_from(vec![SignerInfo {
            version: CmsVersion::V1,
            sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                issuer: cert.tbs_certificate.issuer.clone(),
                serial_number: cert.tbs_certificate.serial_number.clone(),
            }),
            digest_alg: digest_algorithm,
            signed_attrs: None,
            signature_algorithm: AlgorithmIdentifierOwned {
                oid: algo.signature_oid(),
                parameters: None,
            },
            signature: SignatureValue::new(signature).map_err(Error::CmsSign)?,
            unsigned_attrs: None,
        }])
        .map_err(Error::CmsSign)?,
    };

    let signed_data = ContentInfo {
        content_type: const_oid::db::rfc5911::ID_SIGNED_DATA,
        content: Any::encode_from(&signed_data).map_err(Error::CmsSign)?,
    };

    Ok(signed_data)
}
