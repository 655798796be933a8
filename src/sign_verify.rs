use crate::errors::{AssertionKind, AssertionLog, EmailVerifyError};
use crate::utils::{decompose_biguint, LIMB_BITS};
use halo2_base::halo2_proofs::plonk::Error;
use halo2_base::{
    gates::{range::RangeConfig, GateInstructions},
    utils::PrimeField,
    AssignedValue, Context,
    QuantumCell::{Constant, Existing},
};
use halo2_rsa::{AssignedRSAPublicKey, AssignedRSASignature, BigUintConfig, RSAConfig, RSAInstructions, RSAPublicKey, RSASignature};
use itertools::Itertools;
use num_bigint::BigUint;

/// DER encoding of the SHA-256 `DigestInfo` prefix (RFC 3447, section 9.2).
pub const SHA256_DIGEST_INFO: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05, 0x00, 0x04, 0x20,
];
pub const SHA256_DIGEST_BYTES: usize = 32;
/// Minimum length of the `0xFF` padding string.
pub const MIN_PADDING_LEN: usize = 8;

/// Build the EMSA-PKCS1-v1_5 encoding `00 01 FF..FF 00 DigestInfo digest` of `modulus_bytes` bytes.
pub fn pkcs1v15_pad(digest: &[u8], modulus_bytes: usize) -> Result<Vec<u8>, EmailVerifyError> {
    if digest.len() != SHA256_DIGEST_BYTES {
        return Err(EmailVerifyError::InvalidDigestLength(digest.len()));
    }
    let padding_len = modulus_bytes as isize - (SHA256_DIGEST_BYTES + SHA256_DIGEST_INFO.len() + 3) as isize;
    if padding_len < MIN_PADDING_LEN as isize {
        return Err(EmailVerifyError::PaddingTooShort { modulus_bytes, padding_len });
    }
    let mut block = Vec::with_capacity(modulus_bytes);
    block.extend_from_slice(&[0x00, 0x01]);
    block.extend(std::iter::repeat(0xff).take(padding_len as usize));
    block.push(0x00);
    block.extend_from_slice(&SHA256_DIGEST_INFO);
    block.extend_from_slice(digest);
    Ok(block)
}

/// Recover the digest from a well-formed EMSA-PKCS1-v1_5 block, if it is one.
pub fn pkcs1v15_unpad(block: &[u8]) -> Option<Vec<u8>> {
    let body = block.strip_prefix(&[0x00, 0x01])?;
    let padding_len = body.iter().take_while(|b| **b == 0xff).count();
    if padding_len < MIN_PADDING_LEN {
        return None;
    }
    let rest = body[padding_len..].strip_prefix(&[0x00])?;
    let digest = rest.strip_prefix(&SHA256_DIGEST_INFO[..])?;
    (digest.len() == SHA256_DIGEST_BYTES).then(|| digest.to_vec())
}

/// RSA-65537 signature verification over a SHA-256 digest.
///
/// The padded block is built here and compared limb by limb with `signature^65537 mod n`.
#[derive(Debug, Clone)]
pub struct SignVerifyConfig<F: PrimeField> {
    pub rsa_config: RSAConfig<F>,
    public_key_bits: usize,
    /// Little-endian limbs of the padded block with an all-zero digest.
    padding_limbs: Vec<F>,
}

impl<F: PrimeField> SignVerifyConfig<F> {
    pub fn configure(range_config: RangeConfig<F>, public_key_bits: usize) -> Result<Self, EmailVerifyError> {
        if public_key_bits != 1024 && public_key_bits != 2048 {
            return Err(EmailVerifyError::UnsupportedModulusBits(public_key_bits));
        }
        let block = pkcs1v15_pad(&[0u8; SHA256_DIGEST_BYTES], public_key_bits / 8)?;
        let padding_limbs = decompose_biguint(&BigUint::from_bytes_be(&block), public_key_bits / LIMB_BITS, LIMB_BITS);
        let biguint_config = BigUintConfig::construct(range_config, LIMB_BITS);
        let rsa_config = RSAConfig::construct(biguint_config, public_key_bits, 5);
        Ok(Self {
            rsa_config,
            public_key_bits,
            padding_limbs,
        })
    }

    pub fn public_key_bits(&self) -> usize {
        self.public_key_bits
    }

    /// Assign the key and signature and constrain `signature^65537 mod n` to the padded `digest_bytes`.
    ///
    /// `digest_bytes` are the 32 digest bytes in big-endian order, each already constrained to 8 bits.
    pub fn verify_signature<'v>(
        &self,
        ctx: &mut Context<'v, F>,
        digest_bytes: &[AssignedValue<'v, F>],
        public_key: RSAPublicKey<F>,
        signature: RSASignature<F>,
        log: &AssertionLog,
    ) -> Result<(AssignedRSAPublicKey<'v, F>, AssignedRSASignature<'v, F>), Error> {
        assert_eq!(digest_bytes.len(), SHA256_DIGEST_BYTES);
        let gate = self.rsa_config.gate();
        let limb_bytes = LIMB_BITS / 8;
        let mut reversed = digest_bytes.to_vec();
        reversed.reverse();
        let bases = (0..limb_bytes).map(|i| Constant(F::from(1u64 << (8 * i)))).collect_vec();
        let digest_limbs = reversed
            .chunks(limb_bytes)
            .map(|chunk| gate.inner_product(ctx, chunk.iter().map(Existing), bases.clone()))
            .collect_vec();

        let public_key = self.rsa_config.assign_public_key(ctx, public_key)?;
        let signature = self.rsa_config.assign_signature(ctx, signature)?;
        let powed = self.rsa_config.modpow_public_key(ctx, &signature.c, &public_key)?;
        for (idx, limb) in powed.limbs().iter().enumerate() {
            match digest_limbs.get(idx) {
                Some(expected) => {
                    log.check_equal(AssertionKind::SignatureMismatch, limb, expected);
                    gate.assert_equal(ctx, Existing(limb), Existing(expected));
                }
                None => {
                    log.check_const(AssertionKind::SignatureMismatch, limb, self.padding_limbs[idx]);
                    gate.assert_is_const(ctx, limb, self.padding_limbs[idx]);
                }
            }
        }
        Ok((public_key, signature))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{RangeTestCircuit, TEST_DEGREE};
    use halo2_base::halo2_proofs::{circuit::Value, dev::MockProver, halo2curves::bn256::Fr};
    use halo2_rsa::RSAPubE;
    use rand::thread_rng;
    use rsa::{traits::PublicKeyParts, Pkcs1v15Sign, RsaPrivateKey};
    use sha2::{Digest, Sha256};

    #[test]
    fn test_pad_round_trip() {
        let digest = Sha256::digest(b"from:alice@zkemail.com\r\n").to_vec();
        for modulus_bytes in [128usize, 256] {
            let block = pkcs1v15_pad(&digest, modulus_bytes).unwrap();
            assert_eq!(block.len(), modulus_bytes);
            assert_eq!(pkcs1v15_unpad(&block), Some(digest.clone()));
        }
    }

    #[test]
    fn test_pad_layout() {
        let block = pkcs1v15_pad(&[7u8; 32], 128).unwrap();
        assert_eq!(&block[..2], &[0x00, 0x01]);
        assert!(block[2..2 + 74].iter().all(|b| *b == 0xff));
        assert_eq!(block[76], 0x00);
        assert_eq!(&block[77..96], &SHA256_DIGEST_INFO);
    }

    #[test]
    fn test_pad_too_short() {
        assert!(pkcs1v15_pad(&[0u8; 32], 62).is_ok());
        assert_eq!(
            pkcs1v15_pad(&[0u8; 32], 61),
            Err(EmailVerifyError::PaddingTooShort {
                modulus_bytes: 61,
                padding_len: 7
            })
        );
        assert_eq!(pkcs1v15_pad(&[0u8; 31], 128), Err(EmailVerifyError::InvalidDigestLength(31)));
    }

    #[test]
    fn test_unpad_rejects_malformed() {
        let mut block = pkcs1v15_pad(&[1u8; 32], 128).unwrap();
        block[1] = 0x02;
        assert_eq!(pkcs1v15_unpad(&block), None);
        let mut block = pkcs1v15_pad(&[1u8; 32], 128).unwrap();
        block[80] ^= 1;
        assert_eq!(pkcs1v15_unpad(&block), None);
    }

    #[test]
    fn test_pad_matches_rsa_crate() {
        let mut rng = thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("failed to generate a key");
        let digest = Sha256::digest(b"dkim-signature:v=1; a=rsa-sha256; b=").to_vec();
        let signature = private_key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).unwrap();
        let n = BigUint::from_bytes_be(&private_key.n().to_bytes_be());
        let powed = BigUint::from_bytes_be(&signature).modpow(&BigUint::from(65537u64), &n);
        assert_eq!(powed, BigUint::from_bytes_be(&pkcs1v15_pad(&digest, 128).unwrap()));
    }

    /// Rows needed by a 2048-bit modular exponentiation with the test columns.
    const DEGREE_2048: u32 = 19;

    fn sign(public_key_bits: usize, message: &[u8], tamper_signature: bool) -> (Vec<u8>, BigUint, BigUint) {
        let mut rng = thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, public_key_bits).expect("failed to generate a key");
        let digest = Sha256::digest(message).to_vec();
        let mut signature = private_key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).unwrap();
        if tamper_signature {
            signature[64] ^= 0x01;
        }
        let n = BigUint::from_bytes_be(&private_key.n().to_bytes_be());
        (digest, n, BigUint::from_bytes_be(&signature))
    }

    fn verify_check(
        public_key_bits: usize,
        digest: Vec<u8>,
        n: BigUint,
        signature: BigUint,
        log: AssertionLog,
    ) -> impl for<'v> Fn(&mut Context<'v, Fr>, &RangeConfig<Fr>) + Clone {
        move |ctx, range| {
            let config = SignVerifyConfig::configure(range.clone(), public_key_bits).unwrap();
            assert_eq!(config.public_key_bits(), public_key_bits);
            let digest_bytes = digest.iter().map(|b| range.gate.load_witness(ctx, Value::known(Fr::from(*b as u64)))).collect_vec();
            let public_key = RSAPublicKey::new(Value::known(n.clone()), RSAPubE::Fix(BigUint::from(65537u64)));
            let signature = RSASignature::new(Value::known(signature.clone()));
            config.verify_signature(ctx, &digest_bytes, public_key, signature, &log).unwrap();
        }
    }

    fn run_verify(message: &[u8], tamper_signature: bool) -> (AssertionLog, bool) {
        let (digest, n, signature) = sign(1024, message, tamper_signature);
        let log = AssertionLog::new();
        let circuit = RangeTestCircuit::<Fr, _>::new(verify_check(1024, digest, n, signature, log.clone()));
        let ok = MockProver::run(TEST_DEGREE, &circuit, vec![]).unwrap().verify().is_ok();
        (log, ok)
    }

    fn run_verify_2048(message: &[u8], tamper_signature: bool) -> (AssertionLog, bool) {
        let (digest, n, signature) = sign(2048, message, tamper_signature);
        let log = AssertionLog::new();
        let circuit = RangeTestCircuit::<Fr, _, DEGREE_2048>::new(verify_check(2048, digest, n, signature, log.clone()));
        let ok = MockProver::run(DEGREE_2048, &circuit, vec![]).unwrap().verify().is_ok();
        (log, ok)
    }

    #[test]
    fn test_verify_signature() {
        let (log, ok) = run_verify(b"from:alice@zkemail.com\r\n", false);
        assert!(ok);
        assert!(log.kinds().is_empty());
    }

    #[test]
    fn test_verify_signature_tampered() {
        let (log, ok) = run_verify(b"from:alice@zkemail.com\r\n", true);
        assert!(!ok);
        assert_eq!(log.kinds(), vec![AssertionKind::SignatureMismatch]);
    }

    #[test]
    fn test_verify_signature_2048() {
        let (log, ok) = run_verify_2048(b"from:alice@zkemail.com\r\n", false);
        assert!(ok);
        assert!(log.kinds().is_empty());

        let (log, ok) = run_verify_2048(b"from:alice@zkemail.com\r\n", true);
        assert!(!ok);
        assert_eq!(log.kinds(), vec![AssertionKind::SignatureMismatch]);
    }

    #[test]
    fn test_unsupported_modulus() {
        let circuit = RangeTestCircuit::<Fr, _>::new(|_ctx, range| {
            assert_eq!(
                SignVerifyConfig::configure(range.clone(), 1536).map(|_| ()),
                Err(EmailVerifyError::UnsupportedModulusBits(1536))
            );
        });
        assert!(MockProver::run(TEST_DEGREE, &circuit, vec![]).unwrap().verify().is_ok());
    }
}
