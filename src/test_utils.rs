use halo2_base::halo2_proofs::circuit::{Layouter, SimpleFloorPlanner};
use halo2_base::halo2_proofs::plonk::{Circuit, ConstraintSystem, Error};
use halo2_base::utils::{fe_to_biguint, value_to_option, PrimeField};
use halo2_base::{
    gates::range::{RangeConfig, RangeStrategy::Vertical},
    AssignedValue, Context, ContextParams, SKIP_FIRST_PASS,
};
use std::marker::PhantomData;

pub const TEST_DEGREE: u32 = 17;
const TEST_LOOKUP_BITS: usize = 16;
const TEST_NUM_ADVICE: usize = 4;

/// A circuit of `2^DEGREE` rows running `check` inside one halo2-base context.
#[derive(Clone)]
pub struct RangeTestCircuit<F: PrimeField, C, const DEGREE: u32 = TEST_DEGREE> {
    check: C,
    _f: PhantomData<F>,
}

impl<F: PrimeField, C, const DEGREE: u32> RangeTestCircuit<F, C, DEGREE>
where
    C: for<'v> Fn(&mut Context<'v, F>, &RangeConfig<F>) + Clone,
{
    pub fn new(check: C) -> Self {
        Self { check, _f: PhantomData }
    }
}

impl<F: PrimeField, C, const DEGREE: u32> Circuit<F> for RangeTestCircuit<F, C, DEGREE>
where
    C: for<'v> Fn(&mut Context<'v, F>, &RangeConfig<F>) + Clone,
{
    type Config = RangeConfig<F>;
    type FloorPlanner = SimpleFloorPlanner;

    fn without_witnesses(&self) -> Self {
        self.clone()
    }

    fn configure(meta: &mut ConstraintSystem<F>) -> Self::Config {
        RangeConfig::configure(meta, Vertical, &[TEST_NUM_ADVICE], &[1], 1, TEST_LOOKUP_BITS, 0, DEGREE as usize)
    }

    fn synthesize(&self, config: Self::Config, mut layouter: impl Layouter<F>) -> Result<(), Error> {
        config.load_lookup_table(&mut layouter)?;
        let mut first_pass = SKIP_FIRST_PASS;
        layouter.assign_region(
            || "test",
            |region| {
                if first_pass {
                    first_pass = false;
                    return Ok(());
                }
                let mut ctx = Context::new(
                    region,
                    ContextParams {
                        max_rows: config.gate.max_rows,
                        num_context_ids: 1,
                        fixed_columns: config.gate.constants.clone(),
                    },
                );
                (self.check)(&mut ctx, &config);
                config.finalize(&mut ctx);
                Ok(())
            },
        )
    }
}

/// The known witness of `cell` as a u64 (its lowest 64 bits).
pub fn cell_u64<F: PrimeField>(cell: &AssignedValue<F>) -> u64 {
    value_to_option(cell.value().map(|v| fe_to_biguint(v).iter_u64_digits().next().unwrap_or(0))).expect("the witness must be known")
}
