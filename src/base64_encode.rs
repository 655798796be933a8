use crate::utils::bits_less_than;
use halo2_base::{
    gates::{range::RangeConfig, GateInstructions, RangeInstructions},
    utils::PrimeField,
    AssignedValue, Context,
    QuantumCell::{Constant, Existing},
};
use itertools::Itertools;
use num_bigint::BigUint;

/// Length of the standard (padded) base64 encoding of a SHA-256 digest.
pub const DIGEST_BASE64_LEN: usize = 44;

/// Standard base64 encoding of assigned bytes, with `=` padding.
#[derive(Debug, Clone)]
pub struct Base64EncodeConfig<F: PrimeField> {
    range: RangeConfig<F>,
}

impl<F: PrimeField> Base64EncodeConfig<F> {
    pub fn configure(range: RangeConfig<F>) -> Self {
        Self { range }
    }

    /// Encode `bytes` into `4 * ceil(len / 3)` ASCII characters.
    ///
    /// Each byte is decomposed into bits, which also constrains it to 8 bits.
    pub fn encode<'v>(&self, ctx: &mut Context<'v, F>, bytes: &[AssignedValue<'v, F>]) -> Vec<AssignedValue<'v, F>> {
        let gate = self.range.gate();
        let zero = gate.load_zero(ctx);
        let mut encoded = Vec::with_capacity((bytes.len() + 2) / 3 * 4);
        for chunk in bytes.chunks(3) {
            // Big-endian bit string of the chunk, zero-filled to 24 bits.
            let mut bits = Vec::with_capacity(24);
            for idx in 0..3 {
                match chunk.get(idx) {
                    Some(byte) => bits.extend(gate.num_to_bits(ctx, byte, 8).into_iter().rev()),
                    None => bits.extend(std::iter::repeat(zero.clone()).take(8)),
                }
            }
            let num_chars = chunk.len() + 1;
            for sextet_bits in bits.chunks(6).take(num_chars) {
                encoded.push(self.sextet_to_char(ctx, sextet_bits));
            }
            for _ in num_chars..4 {
                encoded.push(gate.load_constant(ctx, F::from(b'=' as u64)));
            }
        }
        encoded
    }

    /// Map the big-endian bits of a value in `[0, 64)` to its character of the standard alphabet.
    ///
    /// The class of the value is read off its bits: `A-Z`, `a-z`, `0-9`, then `+` and `/`.
    fn sextet_to_char<'v>(&self, ctx: &mut Context<'v, F>, sextet_bits: &[AssignedValue<'v, F>]) -> AssignedValue<'v, F> {
        let gate = self.range.gate();
        let weights = (0..6).rev().map(|i| Constant(F::from(1u64 << i))).collect_vec();
        let sextet = gate.inner_product(ctx, sextet_bits.iter().map(Existing), weights);
        let lt_26 = bits_less_than(ctx, gate, sextet_bits, &BigUint::from(26u8));
        let lt_52 = bits_less_than(ctx, gate, sextet_bits, &BigUint::from(52u8));
        let lt_62 = bits_less_than(ctx, gate, sextet_bits, &BigUint::from(62u8));
        // 62 and 63 differ only in the lowest bit.
        let is_63 = &sextet_bits[5];

        let upper = gate.add(ctx, Existing(&sextet), Constant(F::from(b'A' as u64)));
        let lower = gate.add(ctx, Existing(&sextet), Constant(F::from(b'a' as u64 - 26)));
        let digit = gate.sub(ctx, Existing(&sextet), Constant(F::from(52 - b'0' as u64)));

        let symbol = gate.select(ctx, Constant(F::from(b'/' as u64)), Constant(F::from(b'+' as u64)), Existing(is_63));
        let char = gate.select(ctx, Existing(&digit), Existing(&symbol), Existing(&lt_62));
        let char = gate.select(ctx, Existing(&lower), Existing(&char), Existing(&lt_52));
        gate.select(ctx, Existing(&upper), Existing(&char), Existing(&lt_26))
    }
}
