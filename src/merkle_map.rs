use crate::errors::{AssertionKind, AssertionLog};
use crate::poseidon_circuit::PoseidonChip;
use crate::utils::{bits_less_than, field_modulus, poseidon_hash_fields};
use halo2_base::halo2_proofs::circuit::Value;
use halo2_base::{
    gates::{flex_gate::FlexGateConfig, GateInstructions},
    utils::{biguint_to_fe, fe_to_biguint, PrimeField},
    AssignedValue, Context,
    QuantumCell::{Constant, Existing},
};
use itertools::Itertools;
use num_bigint::BigUint;
use std::collections::HashMap;

/// Number of key bits, one per tree level.
pub const MAP_DEPTH: usize = 254;

/// Hash of two children.
pub fn hash_node<F: PrimeField>(left: F, right: F) -> F {
    poseidon_hash_fields(&[left, right])
}

/// Roots of empty subtrees, indexed by height. `empty[0]` is the empty leaf value `0`.
pub fn empty_subtree_roots<F: PrimeField>() -> Vec<F> {
    let mut roots = Vec::with_capacity(MAP_DEPTH + 1);
    roots.push(F::zero());
    for level in 0..MAP_DEPTH {
        roots.push(hash_node(roots[level], roots[level]));
    }
    roots
}

fn key_bits<F: PrimeField>(key: &F) -> Vec<bool> {
    let key = fe_to_biguint(key);
    (0..MAP_DEPTH).map(|level| key.bit(level as u64)).collect()
}

/// Authentication path of one key of a [`MerkleMap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapWitness<F: PrimeField> {
    /// Sibling hashes from the leaf level upward.
    pub siblings: Vec<F>,
    /// Key bits from the leaf level upward; `true` when the path node is a right child.
    pub path: Vec<bool>,
    /// The leaf value at the time the witness was taken.
    pub prior_value: F,
}

impl<F: PrimeField> MapWitness<F> {
    /// Root obtained by placing `value` at the leaf of this path.
    pub fn compute_root(&self, value: F) -> F {
        self.siblings.iter().zip(self.path.iter()).fold(value, |node, (sibling, is_right)| {
            if *is_right {
                hash_node(*sibling, node)
            } else {
                hash_node(node, *sibling)
            }
        })
    }

    /// The integer encoded by the path bits.
    fn path_value(&self) -> BigUint {
        let mut key = BigUint::default();
        for (level, bit) in self.path.iter().enumerate() {
            key.set_bit(level as u64, *bit);
        }
        key
    }

    /// Whether the path is the one of a field element, i.e. it encodes a value below the modulus.
    pub fn is_canonical(&self) -> bool {
        self.path.len() == MAP_DEPTH && self.path_value() < field_modulus::<F>()
    }

    /// The key whose path this is, reduced into the field.
    pub fn compute_key(&self) -> F {
        biguint_to_fe(&(self.path_value() % field_modulus::<F>()))
    }
}

/// Sparse Merkle map from field keys to field values, with every absent leaf equal to zero.
#[derive(Debug, Clone)]
pub struct MerkleMap<F: PrimeField> {
    empty: Vec<F>,
    /// Non-empty nodes keyed by `(height, index)`.
    nodes: HashMap<(usize, BigUint), F>,
}

impl<F: PrimeField> Default for MerkleMap<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: PrimeField> MerkleMap<F> {
    pub fn new() -> Self {
        Self {
            empty: empty_subtree_roots(),
            nodes: HashMap::new(),
        }
    }

    /// Root of the map with no entries.
    pub fn empty_root() -> F {
        empty_subtree_roots::<F>()[MAP_DEPTH]
    }

    fn node(&self, height: usize, index: &BigUint) -> F {
        self.nodes.get(&(height, index.clone())).copied().unwrap_or(self.empty[height])
    }

    pub fn root(&self) -> F {
        self.node(MAP_DEPTH, &BigUint::default())
    }

    pub fn get(&self, key: &F) -> F {
        self.node(0, &fe_to_biguint(key))
    }

    pub fn set(&mut self, key: &F, value: F) {
        let mut index = fe_to_biguint(key);
        let mut node = value;
        self.nodes.insert((0, index.clone()), node);
        for height in 0..MAP_DEPTH {
            let sibling = self.node(height, &(&index ^ BigUint::from(1u8)));
            node = if index.bit(0) { hash_node(sibling, node) } else { hash_node(node, sibling) };
            index >>= 1;
            self.nodes.insert((height + 1, index.clone()), node);
        }
    }

    pub fn get_witness(&self, key: &F) -> MapWitness<F> {
        let path = key_bits(key);
        let mut index = fe_to_biguint(key);
        let mut siblings = Vec::with_capacity(MAP_DEPTH);
        for height in 0..MAP_DEPTH {
            siblings.push(self.node(height, &(&index ^ BigUint::from(1u8))));
            index >>= 1;
        }
        MapWitness {
            siblings,
            path,
            prior_value: self.get(key),
        }
    }
}

/// Assigned path bits of one key and the key they encode.
#[derive(Debug, Clone)]
pub struct AssignedMapPath<'v, F: PrimeField> {
    pub key: AssignedValue<'v, F>,
    /// Key bits from the leaf level upward.
    pub bits: Vec<AssignedValue<'v, F>>,
}

/// Recomputes map roots from a witnessed path inside the circuit.
#[derive(Debug, Clone)]
pub struct MapWitnessChip<F: PrimeField> {
    gate: FlexGateConfig<F>,
    poseidon: PoseidonChip<F>,
}

impl<F: PrimeField> MapWitnessChip<F> {
    pub fn configure(gate: FlexGateConfig<F>) -> Self {
        Self {
            gate,
            poseidon: PoseidonChip::new(),
        }
    }

    /// Assign the path bits and the key they encode.
    ///
    /// Constrains every bit to be boolean and the encoded value to be below the field modulus, so each key has
    /// exactly one path.
    pub fn assign_path<'v>(&self, ctx: &mut Context<'v, F>, path: &[bool], log: &AssertionLog) -> AssignedMapPath<'v, F> {
        assert_eq!(path.len(), MAP_DEPTH);
        let gate = &self.gate;
        let bits = path
            .iter()
            .map(|bit| {
                let bit = gate.load_witness(ctx, Value::known(if *bit { F::one() } else { F::zero() }));
                let squared = gate.mul(ctx, Existing(&bit), Existing(&bit));
                gate.assert_equal(ctx, Existing(&squared), Existing(&bit));
                bit
            })
            .collect_vec();
        let mut powers = Vec::with_capacity(MAP_DEPTH);
        let mut power = F::one();
        for _ in 0..MAP_DEPTH {
            powers.push(Constant(power));
            power = power + power;
        }
        let key = gate.inner_product(ctx, bits.iter().map(Existing), powers);

        let bits_msb = bits.iter().rev().cloned().collect_vec();
        let canonical = bits_less_than(ctx, gate, &bits_msb, &field_modulus::<F>());
        log.check_const(AssertionKind::RegistryKeyMismatch, &canonical, F::one());
        gate.assert_is_const(ctx, &canonical, F::one());
        AssignedMapPath { key, bits }
    }

    /// Recompute the root for `value` placed at the leaf of `path`, with the sibling hashes witnessed.
    pub fn compute_root<'v>(
        &self,
        ctx: &mut Context<'v, F>,
        path: &AssignedMapPath<'v, F>,
        siblings: &[AssignedValue<'v, F>],
        value: &AssignedValue<'v, F>,
    ) -> AssignedValue<'v, F> {
        assert_eq!(siblings.len(), MAP_DEPTH);
        let gate = &self.gate;
        let mut node = value.clone();
        for (sibling, is_right) in siblings.iter().zip(path.bits.iter()) {
            let left = gate.select(ctx, Existing(sibling), Existing(&node), Existing(is_right));
            let right = gate.select(ctx, Existing(&node), Existing(sibling), Existing(is_right));
            node = self.poseidon.hash_elements(ctx, gate, &[left, right]);
        }
        node
    }
}
