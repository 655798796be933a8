use crate::utils::{POSEIDON_RATE, POSEIDON_R_F, POSEIDON_R_P, POSEIDON_T};
use halo2_base::{
    gates::{flex_gate::FlexGateConfig, GateInstructions},
    utils::PrimeField,
    AssignedValue, Context,
    QuantumCell::{Constant, Existing},
};
use itertools::Itertools;
use poseidon::{SparseMDSMatrix, Spec};

/// In-circuit Poseidon hash, equal to [`crate::utils::poseidon_hash_fields`].
///
/// The permutation follows the optimized round schedule of the `poseidon` crate
/// (pre-added constants, sparse MDS matrices in the partial rounds).
#[derive(Debug, Clone)]
pub struct PoseidonChip<F: PrimeField> {
    spec: Spec<F, POSEIDON_T, POSEIDON_RATE>,
}

impl<F: PrimeField> Default for PoseidonChip<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: PrimeField> PoseidonChip<F> {
    pub fn new() -> Self {
        Self {
            spec: Spec::new(POSEIDON_R_F, POSEIDON_R_P),
        }
    }

    /// Hash `inputs` with a fresh sponge.
    pub fn hash_elements<'v>(&self, ctx: &mut Context<'v, F>, gate: &FlexGateConfig<F>, inputs: &[AssignedValue<'v, F>]) -> AssignedValue<'v, F> {
        let mut state = PoseidonState::new(ctx, gate);
        for chunk in inputs.chunks(POSEIDON_RATE) {
            state.permutation(ctx, gate, &self.spec, chunk);
        }
        if inputs.len() % POSEIDON_RATE == 0 {
            state.permutation(ctx, gate, &self.spec, &[]);
        }
        state.inner[1].clone()
    }
}

struct PoseidonState<'v, F: PrimeField> {
    inner: Vec<AssignedValue<'v, F>>,
}

impl<'v, F: PrimeField> PoseidonState<'v, F> {
    fn new(ctx: &mut Context<'v, F>, gate: &FlexGateConfig<F>) -> Self {
        let capacity = gate.load_constant(ctx, F::from_u128(1 << 64));
        let zero = gate.load_zero(ctx);
        let mut inner = vec![capacity];
        inner.extend(std::iter::repeat(zero).take(POSEIDON_T - 1));
        Self { inner }
    }

    fn permutation(&mut self, ctx: &mut Context<'v, F>, gate: &FlexGateConfig<F>, spec: &Spec<F, POSEIDON_T, POSEIDON_RATE>, inputs: &[AssignedValue<'v, F>]) {
        let r_f = spec.r_f() / 2;
        let mds = spec.mds_matrices().mds().rows();
        let pre_sparse_mds = spec.mds_matrices().pre_sparse_mds().rows();
        let sparse_matrices = spec.mds_matrices().sparse_matrices();

        let constants = spec.constants().start();
        self.absorb_with_pre_constants(ctx, gate, inputs, &constants[0]);
        for constants in constants.iter().skip(1).take(r_f - 1) {
            self.sbox_full(ctx, gate, constants);
            self.apply_mds(ctx, gate, &mds);
        }
        self.sbox_full(ctx, gate, &constants[constants.len() - 1]);
        self.apply_mds(ctx, gate, &pre_sparse_mds);

        for (constant, sparse_mds) in spec.constants().partial().iter().zip(sparse_matrices.iter()) {
            self.sbox_part(ctx, gate, constant);
            self.apply_sparse_mds(ctx, gate, sparse_mds);
        }

        for constants in spec.constants().end().iter() {
            self.sbox_full(ctx, gate, constants);
            self.apply_mds(ctx, gate, &mds);
        }
        self.sbox_full(ctx, gate, &[F::zero(); POSEIDON_T]);
        self.apply_mds(ctx, gate, &mds);
    }

    /// Add the inputs, the first round constants and the `1` padding marker after the last input.
    fn absorb_with_pre_constants(
        &mut self,
        ctx: &mut Context<'v, F>,
        gate: &FlexGateConfig<F>,
        inputs: &[AssignedValue<'v, F>],
        pre_constants: &[F; POSEIDON_T],
    ) {
        assert!(inputs.len() < POSEIDON_T);
        let mut next = Vec::with_capacity(POSEIDON_T);
        next.push(gate.add(ctx, Existing(&self.inner[0]), Constant(pre_constants[0])));
        for (idx, state) in self.inner.iter().enumerate().skip(1) {
            let cell = match inputs.get(idx - 1) {
                Some(input) => gate.sum(ctx, vec![Existing(state), Existing(input), Constant(pre_constants[idx])]),
                None if idx == inputs.len() + 1 => gate.add(ctx, Existing(state), Constant(pre_constants[idx] + F::one())),
                None => gate.add(ctx, Existing(state), Constant(pre_constants[idx])),
            };
            next.push(cell);
        }
        self.inner = next;
    }

    fn sbox_full(&mut self, ctx: &mut Context<'v, F>, gate: &FlexGateConfig<F>, constants: &[F; POSEIDON_T]) {
        for (state, constant) in self.inner.iter_mut().zip(constants.iter()) {
            *state = sbox(ctx, gate, state, *constant);
        }
    }

    fn sbox_part(&mut self, ctx: &mut Context<'v, F>, gate: &FlexGateConfig<F>, constant: &F) {
        self.inner[0] = sbox(ctx, gate, &self.inner[0], *constant);
    }

    fn apply_mds(&mut self, ctx: &mut Context<'v, F>, gate: &FlexGateConfig<F>, mds: &[[F; POSEIDON_T]; POSEIDON_T]) {
        self.inner = mds
            .iter()
            .map(|row| gate.inner_product(ctx, self.inner.iter().map(Existing), row.iter().map(|c| Constant(*c))))
            .collect_vec();
    }

    fn apply_sparse_mds(&mut self, ctx: &mut Context<'v, F>, gate: &FlexGateConfig<F>, mds: &SparseMDSMatrix<F, POSEIDON_T, POSEIDON_RATE>) {
        let first = gate.inner_product(ctx, self.inner.iter().map(Existing), mds.row().iter().map(|c| Constant(*c)));
        let mut next = vec![first];
        for (coeff, state) in mds.col_hat().iter().zip(self.inner.iter().skip(1)) {
            next.push(gate.mul_add(ctx, Existing(&self.inner[0]), Constant(*coeff), Existing(state)));
        }
        self.inner = next;
    }
}

/// `x^5 + constant`
fn sbox<'v, F: PrimeField>(ctx: &mut Context<'v, F>, gate: &FlexGateConfig<F>, x: &AssignedValue<'v, F>, constant: F) -> AssignedValue<'v, F> {
    let x2 = gate.mul(ctx, Existing(x), Existing(x));
    let x4 = gate.mul(ctx, Existing(&x2), Existing(&x2));
    gate.mul_add(ctx, Existing(x), Existing(&x4), Constant(constant))
}
