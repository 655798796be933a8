use crate::base64_encode::DIGEST_BASE64_LEN;
use crate::chars_shift::select_subarray;
use crate::errors::{AssertionKind, EmailVerifyError};
use crate::regex_dfa::DfaDef;
use crate::sign_verify::pkcs1v15_pad;
use crate::utils::pad_bytes;
use base64::{engine::general_purpose, Engine as _};
use cfdkim::canonicalize_signed_email;
use num_bigint::BigUint;
use num_traits::Zero;
use sha2::{Digest, Sha256};
use once_cell::sync::Lazy;
use regex_simple::bytes::Regex;

static BODY_HASH_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"bh=([A-Za-z0-9+/=]+);").expect("the body hash tag regex is valid"));

/// Canonicalized DKIM parts of one email, ready to be fed to [`crate::EmailVerifyCircuit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailVerifyInputs {
    /// The canonicalized signed header, ending with the `b=` tag left empty.
    pub header_bytes: Vec<u8>,
    /// The canonicalized body.
    pub body_bytes: Vec<u8>,
    pub signature: BigUint,
    /// The `n` parameter of the RSA public key. The exponent is 65537.
    pub public_key_n: BigUint,
    /// Byte offset of the base64 body hash inside `header_bytes`.
    pub body_hash_index: usize,
}

impl EmailVerifyInputs {
    /// Build the inputs from already canonicalized parts, locating the `bh=` tag in the header.
    pub fn new(header_bytes: Vec<u8>, body_bytes: Vec<u8>, signature_bytes: &[u8], public_key_n: BigUint) -> Result<Self, EmailVerifyError> {
        let body_hash_index = find_body_hash_index(&header_bytes)?;
        Ok(Self {
            header_bytes,
            body_bytes,
            signature: BigUint::from_bytes_be(signature_bytes),
            public_key_n,
            body_hash_index,
        })
    }

    /// Canonicalize a raw DKIM-signed email and build the inputs.
    pub fn from_email(email_bytes: &[u8], public_key_n: BigUint) -> Result<Self, EmailVerifyError> {
        let (header_bytes, body_bytes, signature_bytes) =
            canonicalize_signed_email(email_bytes).map_err(|e| EmailVerifyError::Canonicalize(format!("{:?}", e)))?;
        log::debug!("canonicalized header of {} bytes, body of {} bytes", header_bytes.len(), body_bytes.len());
        Self::new(header_bytes, body_bytes, &signature_bytes, public_key_n)
    }

    /// The base64 body hash declared in the header.
    pub fn declared_body_hash(&self) -> &[u8] {
        let end = (self.body_hash_index + DIGEST_BASE64_LEN).min(self.header_bytes.len());
        self.header_bytes.get(self.body_hash_index..end).unwrap_or(&[])
    }

    /// Run the checks of the circuit outside of it and return the assertion sites that would fail.
    ///
    /// The header is zero-padded to `header_max_len` before matching.
    pub fn native_assertions(&self, public_key_bits: usize, header_max_len: usize, body_hash_check: bool) -> Vec<AssertionKind> {
        let mut failed = vec![];
        let header_digest = Sha256::digest(&self.header_bytes);
        log::debug!("header sha256 {}", hex::encode(header_digest));
        let signature_ok = match pkcs1v15_pad(&header_digest, public_key_bits / 8) {
            Ok(_) if self.public_key_n.is_zero() => false,
            Ok(block) => {
                let powed = self.signature.modpow(&BigUint::from(65537u64), &self.public_key_n);
                powed == BigUint::from_bytes_be(&block)
            }
            Err(_) => false,
        };
        if !signature_ok {
            failed.push(AssertionKind::SignatureMismatch);
        }
        if !body_hash_check {
            return failed;
        }
        let eval = DfaDef::bodyhash().eval(&pad_bytes(&self.header_bytes, header_max_len));
        if eval.match_count != 1 {
            failed.push(AssertionKind::MatchCount);
        }
        let computed = general_purpose::STANDARD.encode(Sha256::digest(&self.body_bytes)).into_bytes();
        match select_subarray(&eval.reveal, self.body_hash_index, DIGEST_BASE64_LEN) {
            Ok(declared) if declared == computed => {}
            Ok(_) => failed.push(AssertionKind::BodyHashMismatch),
            Err(EmailVerifyError::ZeroStartIndex) => failed.push(AssertionKind::ZeroStartIndex),
            Err(_) => {
                failed.push(AssertionKind::NullByteInWindow);
                failed.push(AssertionKind::BodyHashMismatch);
            }
        }
        failed
    }
}

/// Offset of the value of the first `bh=` tag in `header`.
pub fn find_body_hash_index(header: &[u8]) -> Result<usize, EmailVerifyError> {
    let mut captures = BODY_HASH_TAG.captures_iter(header);
    let first = captures
        .next()
        .and_then(|c| c.get(1))
        .ok_or(EmailVerifyError::BodyHashNotFound)?;
    if captures.next().is_some() {
        log::warn!("the header declares more than one body hash, using the first one");
    }
    Ok(first.start())
}
