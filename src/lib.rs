//! DKIM email verification circuit compatible with the [halo2 library developed by privacy-scaling-explorations team](https://github.com/privacy-scaling-explorations/halo2).
//!
//! Our email verification circuit [`EmailVerifyCircuit`] enables you to prove that
//! - the canonicalized email header is signed with RSA-65537 under the PKCS#1 v1.5 padding, according to the DKIM protocol.
//! - the body hash declared in the `bh=` tag of the header equals the base64-encoded SHA-256 hash of the email body.
//!
//! The only public input is a Poseidon hash of the RSA public key, see [`EmailVerifyPublicInput`].
//! The key itself, the header and the body stay private.
//!
//! You can specify the configuration of the circuit with a json file whose path is set to [`EMAIL_VERIFY_CONFIG_ENV`], see [`EmailVerifyConfigParams`].
//!
//! Our circuit consists of the following chips.
//! - [`regex_dfa::RegexDfaConfig`] runs a fixed pattern over the header bytes and reveals the captured substring.
//! - [`chars_shift::CharsShiftConfig`] selects the declared body hash out of the revealed bytes at a witnessed offset.
//! - [`base64_encode::Base64EncodeConfig`] encodes the computed body hash.
//! - [`sign_verify::SignVerifyConfig`] verifies the RSA signature with the given SHA256 hash and RSA public key.
//! - [`poseidon_circuit::PoseidonChip`] hashes the public key into the public input.
//!
//! The keys trusted for each domain are tracked by the registry in [`dkim_registry`].

/// Base64 encoding of assigned bytes.
pub mod base64_encode;
/// Window selection at a witnessed offset.
pub mod chars_shift;
pub mod config_params;
pub mod dkim_registry;
pub mod errors;
pub mod inputs;
pub mod merkle_map;
pub mod poseidon_circuit;
/// Pattern matching over assigned bytes.
pub mod regex_dfa;
/// RSA signature verification.
pub mod sign_verify;
#[cfg(test)]
pub(crate) mod test_utils;
/// Util functions.
pub mod utils;

use std::fs::File;
use std::marker::PhantomData;

use crate::base64_encode::{Base64EncodeConfig, DIGEST_BASE64_LEN};
use crate::chars_shift::CharsShiftConfig;
use crate::errors::{AssertionKind, AssertionLog, EmailVerifyError};
use crate::inputs::EmailVerifyInputs;
use crate::poseidon_circuit::PoseidonChip;
use crate::regex_dfa::{DfaDef, RegexDfaConfig};
use crate::sign_verify::SignVerifyConfig;
use crate::utils::public_key_fingerprint;
use ark_std::{end_timer, start_timer};
pub use config_params::*;
use halo2_base::halo2_proofs::circuit::{Layouter, SimpleFloorPlanner, Value};
use halo2_base::halo2_proofs::plonk::{Circuit, Column, ConstraintSystem, Error, Instance};
use halo2_base::utils::fe_to_biguint;
use halo2_base::QuantumCell::Existing;
use halo2_base::{gates::range::RangeStrategy::Vertical, SKIP_FIRST_PASS};
use halo2_base::{
    gates::{range::RangeConfig, GateInstructions, RangeInstructions},
    utils::PrimeField,
};
/// Re-export [halo2_dynamic_sha256](https://github.com/zkemail/halo2-dynamic-sha256)
pub use halo2_dynamic_sha256;
use halo2_dynamic_sha256::Sha256DynamicConfig;
/// Re-export [halo2_rsa](https://github.com/zkemail/halo2-rsa)
pub use halo2_rsa;
use halo2_rsa::{RSAPubE, RSAPublicKey, RSASignature};
use num_bigint::BigUint;
use snark_verifier_sdk::CircuitExt;

/// Public input definition of [`EmailVerifyCircuit`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EmailVerifyPublicInput {
    /// A decimal string of the poseidon hash of the `n` parameter in the RSA public key. (The e parameter is fixed to 65537.)
    pub public_key_hash: String,
}

impl EmailVerifyPublicInput {
    pub fn new<F: PrimeField>(public_key_hash: F) -> Self {
        Self {
            public_key_hash: fe_to_biguint(&public_key_hash).to_str_radix(10),
        }
    }

    /// Output [`EmailVerifyPublicInput`] to a json file.
    pub fn write_file(&self, public_input_path: &str) -> std::io::Result<()> {
        let file = File::create(public_input_path)?;
        serde_json::to_writer(file, self)?;
        Ok(())
    }

    /// Read [`EmailVerifyPublicInput`] from a json file.
    pub fn read_file(public_input_path: &str) -> std::io::Result<Self> {
        let file = File::open(public_input_path)?;
        Ok(serde_json::from_reader(file)?)
    }

    /// Output a vector of field values in the instance column.
    pub fn instances<F: PrimeField>(&self) -> Result<Vec<F>, EmailVerifyError> {
        let public_key_hash = F::from_str_vartime(&self.public_key_hash)
            .ok_or_else(|| EmailVerifyError::InvalidConfig(format!("{} is not a field element", self.public_key_hash)))?;
        Ok(vec![public_key_hash])
    }
}

/// Chips used only when the declared body hash is checked.
#[derive(Debug, Clone)]
pub struct BodyHashConfig<F: PrimeField> {
    pub bodyhash_config: RegexDfaConfig<F>,
    pub chars_shift_config: CharsShiftConfig<F>,
    pub base64_config: Base64EncodeConfig<F>,
    /// The body prefix compressed outside the circuit.
    pub skip_prefix_bytes_size: Option<usize>,
}

/// Configuration for [`EmailVerifyCircuit`].
#[derive(Debug, Clone)]
pub struct EmailVerifyConfig<F: PrimeField> {
    pub sha256_config: Sha256DynamicConfig<F>,
    pub sign_verify_config: SignVerifyConfig<F>,
    pub body_hash_config: Option<BodyHashConfig<F>>,
    /// An instance column that contains the hash of the public key `n` parameter.
    pub instances: Column<Instance>,
}

/// Email verification circuit.
#[derive(Debug, Clone)]
pub struct EmailVerifyCircuit<F: PrimeField> {
    /// The canonicalized header bytes.
    pub header_bytes: Vec<u8>,
    /// The canonicalized body bytes.
    pub body_bytes: Vec<u8>,
    pub signature: BigUint,
    /// A `n` parameter of the RSA public key.
    pub public_key_n: BigUint,
    /// The offset of the base64 body hash in the header.
    pub body_hash_index: usize,
    /// The assertion sites violated by the witness, filled during synthesis.
    pub assertions: AssertionLog,
    public_key_bits: usize,
    _f: PhantomData<F>,
}

impl<F: PrimeField> Circuit<F> for EmailVerifyCircuit<F> {
    type Config = EmailVerifyConfig<F>;
    type FloorPlanner = SimpleFloorPlanner;

    fn without_witnesses(&self) -> Self {
        Self {
            header_bytes: vec![],
            body_bytes: vec![],
            signature: BigUint::default(),
            public_key_n: self.public_key_n.clone(),
            body_hash_index: self.body_hash_index,
            assertions: AssertionLog::new(),
            public_key_bits: self.public_key_bits,
            _f: PhantomData,
        }
    }

    fn configure(meta: &mut ConstraintSystem<F>) -> Self::Config {
        let params = default_config_params();
        Self::configure_with_params(meta, &params).expect("invalid email verification configuration")
    }

    fn synthesize(&self, mut config: Self::Config, mut layouter: impl Layouter<F>) -> Result<(), Error> {
        config.sha256_config.range().load_lookup_table(&mut layouter)?;
        config.sha256_config.load(&mut layouter)?;
        let mut first_pass = SKIP_FIRST_PASS;
        let mut public_key_hash_cell = vec![];
        log::debug!(
            "email verify circuit: header {} bytes, body {} bytes, body hash at {}",
            self.header_bytes.len(),
            self.body_bytes.len(),
            self.body_hash_index
        );

        layouter.assign_region(
            || "email verify",
            |region| {
                if first_pass {
                    first_pass = false;
                    return Ok(());
                }
                public_key_hash_cell.clear();
                self.assertions.clear();
                let witness_time = start_timer!(|| "assign email verification witness");
                let ctx = &mut config.sha256_config.new_context(region);
                let range = config.sha256_config.range().clone();
                let gate = range.gate.clone();

                // 1. Verify the RSA signature over the header hash.
                let header_hash = config.sha256_config.digest(ctx, &self.header_bytes, None)?;
                let e = RSAPubE::Fix(BigUint::from(Self::DEFAULT_E));
                let public_key = RSAPublicKey::<F>::new(Value::known(self.public_key_n.clone()), e);
                let signature = RSASignature::<F>::new(Value::known(self.signature.clone()));
                let (assigned_public_key, _) =
                    config
                        .sign_verify_config
                        .verify_signature(ctx, &header_hash.output_bytes, public_key, signature, &self.assertions)?;

                // 2. Compare the declared body hash with the computed one.
                if let Some(body_hash_config) = config.body_hash_config.as_ref() {
                    let precomputed = body_hash_config.skip_prefix_bytes_size.filter(|size| *size > 0);
                    let body_hash = config.sha256_config.digest(ctx, &self.body_bytes, precomputed)?;
                    let encoded = body_hash_config.base64_config.encode(ctx, &body_hash.output_bytes);

                    for byte in header_hash.input_bytes.iter() {
                        range.range_check(ctx, byte, 8);
                    }
                    let matched = body_hash_config.bodyhash_config.match_bytes(ctx, &header_hash.input_bytes);
                    self.assertions.check_const(AssertionKind::MatchCount, &matched.match_count, F::one());
                    gate.assert_is_const(ctx, &matched.match_count, F::one());

                    let start = gate.load_witness(ctx, Value::known(F::from(self.body_hash_index as u64)));
                    let declared = body_hash_config.chars_shift_config.shift(ctx, &matched.reveal, &start, &self.assertions);
                    for (declared, computed) in declared.iter().zip(encoded.iter()) {
                        self.assertions.check_equal(AssertionKind::BodyHashMismatch, declared, computed);
                        gate.assert_equal(ctx, Existing(declared), Existing(computed));
                    }
                }

                // 3. Expose the hash of the public key.
                let poseidon = PoseidonChip::new();
                let public_key_hash = poseidon.hash_elements(ctx, &gate, assigned_public_key.n.limbs());
                public_key_hash_cell.push(public_key_hash.cell());

                range.finalize(ctx);
                end_timer!(witness_time);
                Ok(())
            },
        )?;
        for (idx, cell) in public_key_hash_cell.into_iter().enumerate() {
            layouter.constrain_instance(cell, config.instances, idx)?;
        }
        Ok(())
    }
}

impl<F: PrimeField> CircuitExt<F> for EmailVerifyCircuit<F> {
    fn num_instance(&self) -> Vec<usize> {
        vec![1]
    }

    fn instances(&self) -> Vec<Vec<F>> {
        vec![vec![self.public_key_hash()]]
    }
}

/// Size of `len` bytes after SHA-256 padding.
fn sha256_padded_len(len: usize) -> usize {
    (len + 9 + 63) / 64 * 64
}

impl<F: PrimeField> EmailVerifyCircuit<F> {
    pub const DEFAULT_E: u128 = 65537;

    /// Create a new [`EmailVerifyCircuit`] under the parameters of [`default_config_params`].
    pub fn new(inputs: EmailVerifyInputs) -> Result<Self, EmailVerifyError> {
        Self::new_with_params(inputs, &default_config_params())
    }

    /// Create a new [`EmailVerifyCircuit`], checking the sizes of the inputs against `params`.
    pub fn new_with_params(inputs: EmailVerifyInputs, params: &EmailVerifyConfigParams) -> Result<Self, EmailVerifyError> {
        params.validate()?;
        let public_key_bits = params.sign_verify_params()?.public_key_bits;
        if inputs.public_key_n.bits() as usize != public_key_bits {
            return Err(EmailVerifyError::UnsupportedModulusBits(inputs.public_key_n.bits() as usize));
        }
        let header_max = params.header_params()?.max_variable_byte_size;
        if sha256_padded_len(inputs.header_bytes.len()) > header_max {
            return Err(EmailVerifyError::InputTooLong {
                name: "header",
                len: inputs.header_bytes.len(),
                max: header_max,
            });
        }
        if params.body_hash_check {
            let body_params = params.body_params()?;
            let skip = body_params.skip_prefix_bytes_size.unwrap_or(0);
            if inputs.body_bytes.len() < skip {
                return Err(EmailVerifyError::InvalidConfig(format!(
                    "body of {} bytes is shorter than the skipped prefix of {} bytes",
                    inputs.body_bytes.len(),
                    skip
                )));
            }
            if sha256_padded_len(inputs.body_bytes.len() - skip) > body_params.max_variable_byte_size {
                return Err(EmailVerifyError::InputTooLong {
                    name: "body",
                    len: inputs.body_bytes.len() - skip,
                    max: body_params.max_variable_byte_size,
                });
            }
            if inputs.body_hash_index == 0 {
                return Err(EmailVerifyError::ZeroStartIndex);
            }
            if inputs.body_hash_index + DIGEST_BASE64_LEN > inputs.header_bytes.len() {
                return Err(EmailVerifyError::BodyHashNotFound);
            }
        }
        Ok(Self {
            header_bytes: inputs.header_bytes,
            body_bytes: inputs.body_bytes,
            signature: inputs.signature,
            public_key_n: inputs.public_key_n,
            body_hash_index: inputs.body_hash_index,
            assertions: AssertionLog::new(),
            public_key_bits,
            _f: PhantomData,
        })
    }

    /// The Poseidon hash of the public key limbs, the only public input.
    pub fn public_key_hash(&self) -> F {
        public_key_fingerprint(&self.public_key_n, self.public_key_bits)
    }

    /// Compute public input values as [`EmailVerifyPublicInput`] from the circuit.
    pub fn gen_public_input(&self) -> EmailVerifyPublicInput {
        EmailVerifyPublicInput::new(self.public_key_hash())
    }

    pub fn configure_with_params(meta: &mut ConstraintSystem<F>, params: &EmailVerifyConfigParams) -> Result<EmailVerifyConfig<F>, EmailVerifyError> {
        params.validate()?;
        let range_config = RangeConfig::configure(
            meta,
            Vertical,
            &[params.num_flex_advice],
            &[params.num_range_lookup_advice],
            params.num_flex_fixed,
            params.range_lookup_bits,
            0,
            params.degree as usize,
        );
        let header_params = params.header_params()?;
        let sha256_params = params.sha256_params()?;
        let mut max_byte_sizes = vec![header_params.max_variable_byte_size];
        if params.body_hash_check {
            max_byte_sizes.push(params.body_params()?.max_variable_byte_size);
        }
        let sha256_config = Sha256DynamicConfig::configure(
            meta,
            max_byte_sizes,
            range_config.clone(),
            sha256_params.num_bits_lookup,
            sha256_params.num_advice_columns,
            false,
        );
        let sign_verify_config = SignVerifyConfig::configure(range_config.clone(), params.sign_verify_params()?.public_key_bits)?;

        let body_hash_config = if params.body_hash_check {
            Some(BodyHashConfig {
                bodyhash_config: RegexDfaConfig::configure(range_config.clone(), DfaDef::bodyhash()),
                chars_shift_config: CharsShiftConfig::configure(range_config.gate.clone(), header_params.max_variable_byte_size, DIGEST_BASE64_LEN)?,
                base64_config: Base64EncodeConfig::configure(range_config.clone()),
                skip_prefix_bytes_size: params.body_params()?.skip_prefix_bytes_size,
            })
        } else {
            None
        };

        let instances = meta.instance_column();
        meta.enable_equality(instances);
        Ok(EmailVerifyConfig {
            sha256_config,
            sign_verify_config,
            body_hash_config,
            instances,
        })
    }
}
