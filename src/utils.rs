use halo2_base::gates::{flex_gate::FlexGateConfig, GateInstructions};
use halo2_base::utils::{biguint_to_fe, fe_to_biguint, PrimeField};
use halo2_base::{AssignedValue, Context, QuantumCell::Existing};
use num_bigint::BigUint;
use num_traits::{One, Zero};
use poseidon::Poseidon;

/// Bit width of one limb of the RSA big integers.
pub const LIMB_BITS: usize = 64;

/// Width, rate and round numbers of the Poseidon instance used for fingerprints and the key registry.
pub const POSEIDON_T: usize = 3;
pub const POSEIDON_RATE: usize = 2;
pub const POSEIDON_R_F: usize = 8;
pub const POSEIDON_R_P: usize = 57;

/// Bytes packed into one field element when a byte string is turned into field elements.
pub const PACKED_BYTES_PER_FIELD: usize = 31;

/// Split `e` into `num_limbs` little-endian limbs of `bit_len` bits.
pub fn decompose_biguint<F: PrimeField>(e: &BigUint, num_limbs: usize, bit_len: usize) -> Vec<F> {
    let mask = (BigUint::one() << bit_len) - BigUint::one();
    let mut rest = e.clone();
    let mut limbs = Vec::with_capacity(num_limbs);
    for _ in 0..num_limbs {
        limbs.push(biguint_to_fe(&(&rest & &mask)));
        rest >>= bit_len;
    }
    debug_assert!(rest.is_zero(), "{} does not fit in {} limbs", e, num_limbs);
    limbs
}

/// Native Poseidon hash matching [`crate::poseidon_circuit::PoseidonChip`].
pub fn poseidon_hash_fields<F: PrimeField>(fields: &[F]) -> F {
    let mut hasher = Poseidon::<F, POSEIDON_T, POSEIDON_RATE>::new(POSEIDON_R_F, POSEIDON_R_P);
    hasher.update(fields);
    hasher.squeeze()
}

/// Fingerprint of an RSA modulus: the Poseidon hash of its 64-bit limbs.
pub fn public_key_fingerprint<F: PrimeField>(public_key_n: &BigUint, public_key_bits: usize) -> F {
    let limbs = decompose_biguint::<F>(public_key_n, public_key_bits / LIMB_BITS, LIMB_BITS);
    poseidon_hash_fields(&limbs)
}

/// Pack bytes into field elements, 31 bytes each, little-endian inside a chunk.
pub fn bytes_to_fields<F: PrimeField>(bytes: &[u8]) -> Vec<F> {
    bytes
        .chunks(PACKED_BYTES_PER_FIELD)
        .map(|chunk| biguint_to_fe(&BigUint::from_bytes_le(chunk)))
        .collect()
}

/// Field identifier of a domain name used as the key of the registry map.
///
/// The length is absorbed first so that domains differing only in trailing zero bytes never collide.
pub fn domain_to_field<F: PrimeField>(domain: &str) -> F {
    let mut fields = vec![F::from(domain.len() as u64)];
    fields.extend(bytes_to_fields::<F>(domain.as_bytes()));
    poseidon_hash_fields(&fields)
}

/// Modulus of the field `F`.
pub fn field_modulus<F: PrimeField>() -> BigUint {
    fe_to_biguint(&-F::one()) + BigUint::one()
}

/// Whether the big-endian bits `bits_msb` encode a value below `bound`.
///
/// Scans from the most significant bit, tracking whether the prefix still equals the bound.
/// The bits must already be constrained to be boolean.
pub fn bits_less_than<'v, F: PrimeField>(
    ctx: &mut Context<'v, F>,
    gate: &FlexGateConfig<F>,
    bits_msb: &[AssignedValue<'v, F>],
    bound: &BigUint,
) -> AssignedValue<'v, F> {
    let num_bits = bits_msb.len();
    if bound.bits() as usize > num_bits {
        return gate.load_constant(ctx, F::one());
    }
    let mut eq_prefix = gate.load_constant(ctx, F::one());
    let mut less = gate.load_zero(ctx);
    for (idx, bit) in bits_msb.iter().enumerate() {
        let not_bit = gate.not(ctx, Existing(bit));
        if bound.bit((num_bits - 1 - idx) as u64) {
            let below_here = gate.and(ctx, Existing(&eq_prefix), Existing(&not_bit));
            less = gate.or(ctx, Existing(&less), Existing(&below_here));
            eq_prefix = gate.and(ctx, Existing(&eq_prefix), Existing(bit));
        } else {
            eq_prefix = gate.and(ctx, Existing(&eq_prefix), Existing(&not_bit));
        }
    }
    less
}

/// Zero-pad `bytes` to `max_len`.
pub fn pad_bytes(bytes: &[u8], max_len: usize) -> Vec<u8> {
    let mut padded = bytes.to_vec();
    padded.resize(max_len.max(bytes.len()), 0);
    padded
}
