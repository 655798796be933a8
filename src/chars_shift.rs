use crate::errors::{AssertionKind, AssertionLog, EmailVerifyError};
use halo2_base::{
    gates::{flex_gate::FlexGateConfig, GateInstructions},
    utils::PrimeField,
    AssignedValue, Context,
    QuantumCell::Existing,
};
use itertools::Itertools;

/// Extracts a fixed-length window at a witnessed offset from a revealed byte sequence.
///
/// The window is obtained by rotating the whole sequence left by `start` with a barrel shifter:
/// round `j` rotates by `2^j` when bit `j` of `start` is set.
#[derive(Debug, Clone)]
pub struct CharsShiftConfig<F: PrimeField> {
    gate: FlexGateConfig<F>,
    source_len: usize,
    output_len: usize,
    num_bits: usize,
}

impl<F: PrimeField> CharsShiftConfig<F> {
    pub fn configure(gate: FlexGateConfig<F>, source_len: usize, output_len: usize) -> Result<Self, EmailVerifyError> {
        if output_len > source_len {
            return Err(EmailVerifyError::SubarrayTooLong {
                subarray_len: output_len,
                source_len,
            });
        }
        let num_bits = source_len.next_power_of_two().trailing_zeros().max(1) as usize;
        Ok(Self {
            gate,
            source_len,
            output_len,
            num_bits,
        })
    }

    /// Select `chars[start..start + output_len]`, rotating modulo the source length.
    ///
    /// Constrains `start != 0` and every selected byte to be non-zero.
    pub fn shift<'v>(
        &self,
        ctx: &mut Context<'v, F>,
        chars: &[AssignedValue<'v, F>],
        start: &AssignedValue<'v, F>,
        log: &AssertionLog,
    ) -> Vec<AssignedValue<'v, F>> {
        debug_assert_eq!(chars.len(), self.source_len);
        let gate = &self.gate;
        let start_is_zero = gate.is_zero(ctx, start);
        log.check_const(AssertionKind::ZeroStartIndex, &start_is_zero, F::zero());
        gate.assert_is_const(ctx, &start_is_zero, F::zero());

        let start_bits = gate.num_to_bits(ctx, start, self.num_bits);
        let len = chars.len();
        let mut shifted = chars.to_vec();
        for (j, bit) in start_bits.iter().enumerate() {
            let offset = (1 << j) % len;
            shifted = (0..len)
                .map(|i| gate.select(ctx, Existing(&shifted[(i + offset) % len]), Existing(&shifted[i]), Existing(bit)))
                .collect_vec();
        }
        shifted.truncate(self.output_len);

        for byte in shifted.iter() {
            let is_null = gate.is_zero(ctx, byte);
            log.check_const(AssertionKind::NullByteInWindow, &is_null, F::zero());
            gate.assert_is_const(ctx, &is_null, F::zero());
        }
        shifted
    }
}

/// Native counterpart of [`CharsShiftConfig::shift`].
pub fn select_subarray(chars: &[u8], start: usize, output_len: usize) -> Result<Vec<u8>, EmailVerifyError> {
    if output_len > chars.len() {
        return Err(EmailVerifyError::SubarrayTooLong {
            subarray_len: output_len,
            source_len: chars.len(),
        });
    }
    if start == 0 {
        return Err(EmailVerifyError::ZeroStartIndex);
    }
    let selected = (0..output_len).map(|i| chars[(start + i) % chars.len()]).collect_vec();
    if let Some(offset) = selected.iter().position(|b| *b == 0) {
        return Err(EmailVerifyError::NullByteInWindow { offset });
    }
    Ok(selected)
}
