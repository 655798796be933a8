//! Registry of trusted DKIM public keys.
//!
//! The registry maps a domain identifier (see [`crate::utils::domain_to_field`]) to the fingerprint of the
//! domain's public key (see [`crate::utils::public_key_fingerprint`]). Its only state is the root of a
//! [`MerkleMap`]; every operation takes the caller's view of that root and a [`MapWitness`] for the domain.
//! Updates based on the same root must be applied one after the other: the second caller has to take a new
//! witness against the root returned by the first.

use crate::config_params::default_registry_config_params;
use crate::errors::{AssertionKind, AssertionLog};
use crate::merkle_map::{MapWitness, MapWitnessChip, MerkleMap, MAP_DEPTH};
use halo2_base::halo2_proofs::{
    circuit::{Layouter, SimpleFloorPlanner, Value},
    plonk::{Circuit, Column, ConstraintSystem, Error, Instance},
};
use halo2_base::{
    gates::{
        range::{RangeConfig, RangeStrategy::Vertical},
        GateInstructions,
    },
    utils::{fe_to_biguint, PrimeField},
    Context, ContextParams, QuantumCell::Existing, SKIP_FIRST_PASS,
};
use itertools::Itertools;
use snark_verifier_sdk::CircuitExt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("stale root: expected {expected}, the registry is at {actual}")]
    StaleRoot { expected: String, actual: String },
    #[error("the witness is for another key than the domain")]
    KeyMismatch,
    #[error("the witness does not authenticate against the registry root")]
    RootMismatch,
}

fn field_to_string<F: PrimeField>(value: &F) -> String {
    fe_to_biguint(value).to_str_radix(10)
}

/// The registry state: a single map root, starting at the empty map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DkimRegistry<F: PrimeField> {
    root: F,
}

impl<F: PrimeField> Default for DkimRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: PrimeField> DkimRegistry<F> {
    pub fn new() -> Self {
        Self::from_root(MerkleMap::<F>::empty_root())
    }

    pub fn from_root(root: F) -> Self {
        Self { root }
    }

    pub fn root(&self) -> F {
        self.root
    }

    fn check_fresh(&self, current_root: F) -> Result<(), RegistryError> {
        if current_root != self.root {
            return Err(RegistryError::StaleRoot {
                expected: field_to_string(&current_root),
                actual: field_to_string(&self.root),
            });
        }
        Ok(())
    }

    /// Overwrite the key of `domain` with `key_hash` and return the new root.
    ///
    /// `witness` must be taken against `current_root`, which must be the registry's root.
    pub fn set_key(&mut self, current_root: F, witness: &MapWitness<F>, domain: F, key_hash: F) -> Result<F, RegistryError> {
        self.check_fresh(current_root)?;
        if !witness.is_canonical() || witness.compute_key() != domain {
            return Err(RegistryError::KeyMismatch);
        }
        if witness.compute_root(witness.prior_value) != self.root {
            return Err(RegistryError::RootMismatch);
        }
        let new_root = witness.compute_root(key_hash);
        log::info!("registry root {} -> {}", field_to_string(&self.root), field_to_string(&new_root));
        self.root = new_root;
        Ok(new_root)
    }

    /// Check that `domain` maps to `key_hash` under `current_root`, which must be the registry's root.
    pub fn verify_key(&self, current_root: F, witness: &MapWitness<F>, domain: F, key_hash: F) -> Result<(), RegistryError> {
        self.check_fresh(current_root)?;
        if witness.compute_root(key_hash) != self.root {
            return Err(RegistryError::RootMismatch);
        }
        if !witness.is_canonical() || witness.compute_key() != domain {
            return Err(RegistryError::KeyMismatch);
        }
        Ok(())
    }
}

/// Configuration for [`RegistryCircuit`].
#[derive(Debug, Clone)]
pub struct RegistryConfig<F: PrimeField> {
    pub range: RangeConfig<F>,
    pub map_witness: MapWitnessChip<F>,
    /// `[root_before, root_after, domain, key_hash]`
    pub instances: Column<Instance>,
}

/// Proves a registry transition `root_before -> root_after` that sets `domain` to `key_hash`.
///
/// When the witness already holds `key_hash`, the two roots coincide and the proof is a membership proof.
#[derive(Debug, Clone)]
pub struct RegistryCircuit<F: PrimeField> {
    pub current_root: F,
    pub witness: MapWitness<F>,
    pub domain: F,
    pub key_hash: F,
    pub assertions: AssertionLog,
}

impl<F: PrimeField> RegistryCircuit<F> {
    pub const NUM_INSTANCES: usize = 4;

    pub fn new(current_root: F, witness: MapWitness<F>, domain: F, key_hash: F) -> Self {
        Self {
            current_root,
            witness,
            domain,
            key_hash,
            assertions: AssertionLog::new(),
        }
    }

    pub fn new_root(&self) -> F {
        self.witness.compute_root(self.key_hash)
    }
}

impl<F: PrimeField> Circuit<F> for RegistryCircuit<F> {
    type Config = RegistryConfig<F>;
    type FloorPlanner = SimpleFloorPlanner;

    fn without_witnesses(&self) -> Self {
        Self::new(
            F::zero(),
            MapWitness {
                siblings: vec![F::zero(); MAP_DEPTH],
                path: vec![false; MAP_DEPTH],
                prior_value: F::zero(),
            },
            F::zero(),
            F::zero(),
        )
    }

    fn configure(meta: &mut ConstraintSystem<F>) -> Self::Config {
        let params = default_registry_config_params();
        let range = RangeConfig::configure(
            meta,
            Vertical,
            &[params.num_flex_advice],
            &[params.num_range_lookup_advice],
            params.num_flex_fixed,
            params.range_lookup_bits,
            0,
            params.degree as usize,
        );
        let map_witness = MapWitnessChip::configure(range.gate.clone());
        let instances = meta.instance_column();
        meta.enable_equality(instances);
        RegistryConfig { range, map_witness, instances }
    }

    fn synthesize(&self, config: Self::Config, mut layouter: impl Layouter<F>) -> Result<(), Error> {
        config.range.load_lookup_table(&mut layouter)?;
        let mut first_pass = SKIP_FIRST_PASS;
        let mut public_cells = vec![];
        layouter.assign_region(
            || "dkim registry",
            |region| {
                if first_pass {
                    first_pass = false;
                    return Ok(());
                }
                self.assertions.clear();
                let mut ctx = Context::new(
                    region,
                    ContextParams {
                        max_rows: config.range.gate.max_rows,
                        num_context_ids: 1,
                        fixed_columns: config.range.gate.constants.clone(),
                    },
                );
                let ctx = &mut ctx;
                let gate = &config.range.gate;
                let claimed_root = gate.load_witness(ctx, Value::known(self.current_root));
                let domain = gate.load_witness(ctx, Value::known(self.domain));
                let key_hash = gate.load_witness(ctx, Value::known(self.key_hash));
                let prior_value = gate.load_witness(ctx, Value::known(self.witness.prior_value));
                let path = config.map_witness.assign_path(ctx, &self.witness.path, &self.assertions);
                let siblings = self.witness.siblings.iter().map(|s| gate.load_witness(ctx, Value::known(*s))).collect_vec();

                let before = config.map_witness.compute_root(ctx, &path, &siblings, &prior_value);
                let after = config.map_witness.compute_root(ctx, &path, &siblings, &key_hash);
                self.assertions.check_equal(AssertionKind::RegistryKeyMismatch, &path.key, &domain);
                gate.assert_equal(ctx, Existing(&path.key), Existing(&domain));
                self.assertions.check_equal(AssertionKind::RegistryRootMismatch, &before, &claimed_root);
                gate.assert_equal(ctx, Existing(&before), Existing(&claimed_root));

                public_cells = vec![claimed_root.cell(), after.cell(), domain.cell(), key_hash.cell()];
                config.range.finalize(ctx);
                Ok(())
            },
        )?;
        for (idx, cell) in public_cells.into_iter().enumerate() {
            layouter.constrain_instance(cell, config.instances, idx)?;
        }
        Ok(())
    }
}

impl<F: PrimeField> CircuitExt<F> for RegistryCircuit<F> {
    fn num_instance(&self) -> Vec<usize> {
        vec![Self::NUM_INSTANCES]
    }

    fn instances(&self) -> Vec<Vec<F>> {
        vec![vec![self.current_root, self.new_root(), self.domain, self.key_hash]]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config_params::REGISTRY_CONFIG_ENV;
    use crate::merkle_map::empty_subtree_roots;
    use crate::utils::{domain_to_field, field_modulus, public_key_fingerprint};
    use halo2_base::halo2_proofs::{dev::MockProver, halo2curves::bn256::Fr};
    use num_bigint::BigUint;

    fn fingerprint(seed: u64) -> Fr {
        let n = (BigUint::from(1u8) << 1023) + BigUint::from(seed);
        public_key_fingerprint(&n, 1024)
    }

    #[test]
    fn test_set_then_verify() {
        let mut map = MerkleMap::<Fr>::new();
        let mut registry = DkimRegistry::<Fr>::new();
        assert_eq!(registry.root(), map.root());
        let domain = domain_to_field::<Fr>("zkemail.com");
        let key = fingerprint(1);

        let witness = map.get_witness(&domain);
        let new_root = registry.set_key(registry.root(), &witness, domain, key).unwrap();
        map.set(&domain, key);
        assert_eq!(new_root, map.root());

        let witness = map.get_witness(&domain);
        assert_eq!(registry.verify_key(registry.root(), &witness, domain, key), Ok(()));
        assert_eq!(registry.verify_key(registry.root(), &witness, domain, fingerprint(2)), Err(RegistryError::RootMismatch));
        let other = domain_to_field::<Fr>("example.com");
        assert_eq!(registry.verify_key(registry.root(), &witness, other, key), Err(RegistryError::KeyMismatch));
    }

    #[test]
    fn test_verify_is_idempotent() {
        let mut map = MerkleMap::<Fr>::new();
        let mut registry = DkimRegistry::<Fr>::new();
        let domain = domain_to_field::<Fr>("zkemail.com");
        registry.set_key(registry.root(), &map.get_witness(&domain), domain, fingerprint(1)).unwrap();
        map.set(&domain, fingerprint(1));
        let witness = map.get_witness(&domain);
        let root = registry.root();
        for _ in 0..3 {
            assert_eq!(registry.verify_key(registry.root(), &witness, domain, fingerprint(1)), Ok(()));
            assert_eq!(registry.verify_key(registry.root(), &witness, domain, fingerprint(3)), Err(RegistryError::RootMismatch));
        }
        assert_eq!(registry.root(), root);
    }

    #[test]
    fn test_stale_root_and_overwrite() {
        let mut map = MerkleMap::<Fr>::new();
        let mut registry = DkimRegistry::<Fr>::new();
        let domain = domain_to_field::<Fr>("zkemail.com");
        let empty_root = registry.root();
        let witness = map.get_witness(&domain);
        registry.set_key(empty_root, &witness, domain, fingerprint(1)).unwrap();
        map.set(&domain, fingerprint(1));

        // Rebasing on the old root is rejected.
        let err = registry.set_key(empty_root, &witness, domain, fingerprint(2)).unwrap_err();
        assert!(matches!(err, RegistryError::StaleRoot { .. }));
        // A witness that does not hold the current leaf is rejected.
        assert_eq!(
            registry.set_key(registry.root(), &witness, domain, fingerprint(2)),
            Err(RegistryError::RootMismatch)
        );

        let witness = map.get_witness(&domain);
        registry.set_key(registry.root(), &witness, domain, fingerprint(2)).unwrap();
        map.set(&domain, fingerprint(2));
        assert_eq!(registry.root(), map.root());
        let witness = map.get_witness(&domain);
        assert_eq!(registry.verify_key(registry.root(), &witness, domain, fingerprint(2)), Ok(()));
        assert_eq!(registry.verify_key(registry.root(), &witness, domain, fingerprint(1)), Err(RegistryError::RootMismatch));
    }

    #[test]
    fn test_set_key_rejects_foreign_witness() {
        let map = MerkleMap::<Fr>::new();
        let mut registry = DkimRegistry::<Fr>::new();
        let witness = map.get_witness(&domain_to_field::<Fr>("example.com"));
        let domain = domain_to_field::<Fr>("zkemail.com");
        assert_eq!(
            registry.set_key(registry.root(), &witness, domain, fingerprint(1)),
            Err(RegistryError::KeyMismatch)
        );
        assert_eq!(registry.root(), MerkleMap::<Fr>::empty_root());
    }

    fn populated_map() -> MerkleMap<Fr> {
        let mut map = MerkleMap::<Fr>::new();
        map.set(&domain_to_field::<Fr>("example.com"), fingerprint(10));
        map.set(&domain_to_field::<Fr>("gmail.com"), fingerprint(11));
        map
    }

    #[test]
    fn test_registry_circuit() {
        temp_env::with_var(REGISTRY_CONFIG_ENV, Some("./configs/test_registry.config"), || {
            let params = default_registry_config_params();
            let map = populated_map();
            let domain = domain_to_field::<Fr>("zkemail.com");
            let circuit = RegistryCircuit::new(map.root(), map.get_witness(&domain), domain, fingerprint(1));
            let mut updated = map.clone();
            updated.set(&domain, fingerprint(1));
            assert_eq!(circuit.new_root(), updated.root());
            let prover = MockProver::run(params.degree, &circuit, circuit.instances()).unwrap();
            assert_eq!(prover.verify(), Ok(()));
            assert!(circuit.assertions.kinds().is_empty());
        });
    }

    #[test]
    fn test_registry_circuit_rejects() {
        temp_env::with_var(REGISTRY_CONFIG_ENV, Some("./configs/test_registry.config"), || {
            let params = default_registry_config_params();
            let map = populated_map();
            let domain = domain_to_field::<Fr>("zkemail.com");
            let foreign = map.get_witness(&domain_to_field::<Fr>("example.com"));
            let circuit = RegistryCircuit::new(map.root(), foreign, domain, fingerprint(1));
            let prover = MockProver::run(params.degree, &circuit, circuit.instances()).unwrap();
            assert!(prover.verify().is_err());
            assert_eq!(circuit.assertions.kinds(), vec![AssertionKind::RegistryKeyMismatch]);

            let stale = RegistryCircuit::new(MerkleMap::<Fr>::empty_root(), map.get_witness(&domain), domain, fingerprint(1));
            let prover = MockProver::run(params.degree, &stale, stale.instances()).unwrap();
            assert!(prover.verify().is_err());
            assert_eq!(stale.assertions.kinds(), vec![AssertionKind::RegistryRootMismatch]);
        });
    }

    /// A path of `key + p`, which encodes `key` modulo the field order.
    fn aliased_witness(key: u64) -> MapWitness<Fr> {
        let alias = field_modulus::<Fr>() + BigUint::from(key);
        MapWitness {
            siblings: empty_subtree_roots::<Fr>()[..MAP_DEPTH].to_vec(),
            path: (0..MAP_DEPTH).map(|level| alias.bit(level as u64)).collect(),
            prior_value: Fr::zero(),
        }
    }

    #[test]
    fn test_verify_key_rejects_stale_root() {
        let mut map = MerkleMap::<Fr>::new();
        let mut registry = DkimRegistry::<Fr>::new();
        let domain = domain_to_field::<Fr>("zkemail.com");
        let empty_root = registry.root();
        registry.set_key(empty_root, &map.get_witness(&domain), domain, fingerprint(1)).unwrap();
        map.set(&domain, fingerprint(1));
        let witness = map.get_witness(&domain);
        assert!(matches!(
            registry.verify_key(empty_root, &witness, domain, fingerprint(1)),
            Err(RegistryError::StaleRoot { .. })
        ));
        assert_eq!(registry.verify_key(map.root(), &witness, domain, fingerprint(1)), Ok(()));
    }

    #[test]
    fn test_set_key_rejects_aliased_path() {
        let mut registry = DkimRegistry::<Fr>::new();
        let domain = Fr::from(5);
        let witness = aliased_witness(5);
        assert!(!witness.is_canonical());
        assert_eq!(witness.compute_key(), domain);
        assert_eq!(witness.compute_root(Fr::zero()), registry.root());
        assert_eq!(
            registry.set_key(registry.root(), &witness, domain, fingerprint(1)),
            Err(RegistryError::KeyMismatch)
        );
    }

    #[test]
    fn test_registry_circuit_rejects_aliased_path() {
        temp_env::with_var(REGISTRY_CONFIG_ENV, Some("./configs/test_registry.config"), || {
            let params = default_registry_config_params();
            let domain = Fr::from(5);
            let circuit = RegistryCircuit::new(MerkleMap::<Fr>::empty_root(), aliased_witness(5), domain, fingerprint(1));
            let prover = MockProver::run(params.degree, &circuit, circuit.instances()).unwrap();
            assert!(prover.verify().is_err());
            assert_eq!(circuit.assertions.kinds(), vec![AssertionKind::RegistryKeyMismatch]);

            let canonical = RegistryCircuit::new(
                MerkleMap::<Fr>::empty_root(),
                MerkleMap::<Fr>::new().get_witness(&domain),
                domain,
                fingerprint(1),
            );
            let prover = MockProver::run(params.degree, &canonical, canonical.instances()).unwrap();
            assert_eq!(prover.verify(), Ok(()));
        });
    }
}
