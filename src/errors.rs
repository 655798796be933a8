use halo2_base::halo2_proofs::circuit::Value;
use halo2_base::utils::{value_to_option, PrimeField};
use halo2_base::AssignedValue;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

/// Structural and precondition errors, raised before any constraint is created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmailVerifyError {
    #[error("modulus of {modulus_bytes} bytes leaves a padding string of {padding_len} bytes, at least 8 are required")]
    PaddingTooShort { modulus_bytes: usize, padding_len: isize },
    #[error("unsupported RSA modulus size of {0} bits")]
    UnsupportedModulusBits(usize),
    #[error("subarray of length {subarray_len} exceeds the source length {source_len}")]
    SubarrayTooLong { subarray_len: usize, source_len: usize },
    #[error("{name} of {size} bytes is not a multiple of 64")]
    NotBlockAligned { name: &'static str, size: usize },
    #[error("{name} of {len} bytes exceeds the maximum of {max} bytes")]
    InputTooLong { name: &'static str, len: usize, max: usize },
    #[error("start index 0 is never a valid capture position")]
    ZeroStartIndex,
    #[error("selected window contains a null byte at offset {offset}")]
    NullByteInWindow { offset: usize },
    #[error("expected a 32-byte SHA-256 digest, got {0} bytes")]
    InvalidDigestLength(usize),
    #[error("invalid DFA table: {0}")]
    InvalidDfa(String),
    #[error("body hash tag not found in the header")]
    BodyHashNotFound,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to canonicalize the email: {0}")]
    Canonicalize(String),
}

/// The assertion site an in-circuit check belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, thiserror::Error)]
pub enum AssertionKind {
    #[error("the pattern did not match exactly once")]
    MatchCount,
    #[error("the selected window contains a null byte")]
    NullByteInWindow,
    #[error("the selector start index is zero")]
    ZeroStartIndex,
    #[error("the declared body hash differs from the computed one")]
    BodyHashMismatch,
    #[error("the RSA signature does not verify against the padded header digest")]
    SignatureMismatch,
    #[error("the map witness does not authenticate against the root")]
    RegistryRootMismatch,
    #[error("the map witness key differs from the claimed domain")]
    RegistryKeyMismatch,
}

/// Records which assertion sites were violated while the witness was being assigned.
///
/// The log does not influence the constraints. A violated site still makes the
/// circuit unsatisfiable; the log only tells the caller which check it was.
#[derive(Debug, Clone, Default)]
pub struct AssertionLog {
    kinds: Arc<Mutex<BTreeSet<AssertionKind>>>,
}

impl AssertionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: AssertionKind) {
        log::error!("assertion failed: {}", kind);
        if let Ok(mut kinds) = self.kinds.lock() {
            kinds.insert(kind);
        }
    }

    /// Record `kind` when both values are known and differ.
    pub fn check_equal<F: PrimeField>(&self, kind: AssertionKind, a: &AssignedValue<F>, b: &AssignedValue<F>) {
        let pair = a.value().zip(b.value()).map(|(a, b)| a == b);
        if value_to_option(pair) == Some(false) {
            self.record(kind);
        }
    }

    /// Record `kind` when the value is known and differs from `expected`.
    pub fn check_const<F: PrimeField>(&self, kind: AssertionKind, a: &AssignedValue<F>, expected: F) {
        let eq: Value<bool> = a.value().map(|a| *a == expected);
        if value_to_option(eq) == Some(false) {
            self.record(kind);
        }
    }

    pub fn kinds(&self) -> Vec<AssertionKind> {
        self.kinds.lock().map(|kinds| kinds.iter().copied().collect()).unwrap_or_default()
    }

    pub fn contains(&self, kind: AssertionKind) -> bool {
        self.kinds.lock().map(|kinds| kinds.contains(&kind)).unwrap_or(false)
    }

    pub fn clear(&self) {
        if let Ok(mut kinds) = self.kinds.lock() {
            kinds.clear();
        }
    }
}
