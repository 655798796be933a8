use crate::errors::EmailVerifyError;
use halo2_base::halo2_proofs::circuit::Value;
use halo2_base::{
    gates::{flex_gate::FlexGateConfig, range::RangeConfig, GateInstructions, RangeInstructions},
    utils::PrimeField,
    AssignedValue, Context,
    QuantumCell::{Constant, Existing},
};
use itertools::Itertools;
use std::collections::HashMap;

/// A set of bytes expressed as a disjunction of inclusive ranges and single characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct CharClass {
    pub ranges: Vec<(u8, u8)>,
    pub chars: Vec<u8>,
}

impl CharClass {
    pub fn byte(c: u8) -> Self {
        Self { ranges: vec![], chars: vec![c] }
    }

    pub fn with_range(mut self, lo: u8, hi: u8) -> Self {
        self.ranges.push((lo, hi));
        self
    }

    pub fn with_chars(mut self, chars: &[u8]) -> Self {
        self.chars.extend_from_slice(chars);
        self
    }

    /// `[A-Za-z0-9+/=]`
    pub fn base64() -> Self {
        Self::default().with_range(b'A', b'Z').with_range(b'a', b'z').with_range(b'0', b'9').with_chars(b"+/=")
    }

    /// `[A-Za-z0-9_]`
    pub fn word() -> Self {
        Self::default().with_range(b'A', b'Z').with_range(b'a', b'z').with_range(b'0', b'9').with_chars(b"_")
    }

    pub fn contains(&self, byte: u8) -> bool {
        self.ranges.iter().any(|(lo, hi)| *lo <= byte && byte <= *hi) || self.chars.contains(&byte)
    }
}

/// An edge `from -> to` taken when the consumed byte belongs to `class`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DfaTransition {
    pub from: usize,
    pub to: usize,
    pub class: CharClass,
}

/// State-transition table of a fixed pattern.
///
/// State 0 is the idle state. It is never the target of an edge: it becomes active exactly when no edge fired
/// on the previous byte. Bytes consumed along one of `reveal_transitions` inside a run that reaches
/// `accept_state` are revealed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DfaDef {
    pub num_states: usize,
    pub accept_state: usize,
    pub transitions: Vec<DfaTransition>,
    pub reveal_transitions: Vec<(usize, usize)>,
}

/// Result of running a [`DfaDef`] over native bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfaEval {
    pub match_count: usize,
    /// Same length as the input; the byte at a revealed position, zero elsewhere.
    pub reveal: Vec<u8>,
}

impl DfaEval {
    /// The non-zero revealed bytes in order.
    pub fn revealed_bytes(&self) -> Vec<u8> {
        self.reveal.iter().copied().filter(|b| *b != 0).collect()
    }
}

impl DfaDef {
    pub fn new(
        num_states: usize,
        accept_state: usize,
        transitions: Vec<DfaTransition>,
        reveal_transitions: Vec<(usize, usize)>,
    ) -> Result<Self, EmailVerifyError> {
        if num_states < 2 {
            return Err(EmailVerifyError::InvalidDfa(format!("{} states are too few", num_states)));
        }
        if accept_state == 0 || accept_state >= num_states {
            return Err(EmailVerifyError::InvalidDfa(format!("accept state {} is invalid", accept_state)));
        }
        for t in transitions.iter() {
            if t.from >= num_states || t.to >= num_states {
                return Err(EmailVerifyError::InvalidDfa(format!("edge {} -> {} is out of range", t.from, t.to)));
            }
            if t.to == 0 {
                return Err(EmailVerifyError::InvalidDfa("state 0 cannot be the target of an edge".to_string()));
            }
        }
        for (from, to) in reveal_transitions.iter() {
            if !transitions.iter().any(|t| t.from == *from && t.to == *to) {
                return Err(EmailVerifyError::InvalidDfa(format!("reveal edge {} -> {} is not a transition", from, to)));
            }
        }
        Ok(Self {
            num_states,
            accept_state,
            transitions,
            reveal_transitions,
        })
    }

    /// Table of `bh=([a-zA-Z0-9]|\+|/|=)+;` revealing the base64 run.
    pub fn bodyhash() -> Self {
        let edge = |from, to, class| DfaTransition { from, to, class };
        Self {
            num_states: 6,
            accept_state: 4,
            transitions: vec![
                edge(1, 1, CharClass::base64()),
                edge(5, 1, CharClass::base64()),
                edge(0, 2, CharClass::byte(b'b')),
                edge(2, 3, CharClass::byte(b'h')),
                edge(1, 4, CharClass::byte(b';')),
                edge(3, 5, CharClass::byte(b'=')),
            ],
            reveal_transitions: vec![(5, 1), (1, 1)],
        }
    }

    /// Table of `<prefix>[class]+` revealing the run of `class` right after `prefix`.
    ///
    /// The accept state is the looping capture state, so the match count equals the captured length.
    pub fn handle_after(prefix: &str, class: CharClass) -> Result<Self, EmailVerifyError> {
        let prefix = prefix.as_bytes();
        if prefix.is_empty() {
            return Err(EmailVerifyError::InvalidDfa("the prefix must not be empty".to_string()));
        }
        // 1: last prefix byte consumed, 2: inside the capture, 3..: inner prefix states.
        let num_states = prefix.len() + 2;
        let mut transitions = Vec::with_capacity(prefix.len() + 2);
        let mut from = 0;
        for (idx, byte) in prefix.iter().enumerate() {
            let to = if idx + 1 == prefix.len() { 1 } else { 3 + idx };
            transitions.push(DfaTransition {
                from,
                to,
                class: CharClass::byte(*byte),
            });
            from = to;
        }
        transitions.push(DfaTransition {
            from: 1,
            to: 2,
            class: class.clone(),
        });
        transitions.push(DfaTransition { from: 2, to: 2, class });
        Self::new(num_states, 2, transitions, vec![(1, 2), (2, 2)])
    }

    /// The distinct character classes and, per transition, the index of its class.
    fn class_table(&self) -> (Vec<CharClass>, Vec<usize>) {
        let classes = self.transitions.iter().map(|t| t.class.clone()).unique().collect_vec();
        let indices = self
            .transitions
            .iter()
            .map(|t| classes.iter().position(|c| *c == t.class).unwrap_or_default())
            .collect_vec();
        (classes, indices)
    }

    /// Evaluate the table over `bytes` outside the circuit, tracking every active state at once.
    pub fn eval(&self, bytes: &[u8]) -> DfaEval {
        let n = bytes.len();
        let mut states = vec![vec![false; self.num_states]; n + 1];
        states[0][0] = true;
        let mut changed = vec![false; n];
        for (i, byte) in bytes.iter().enumerate() {
            for t in self.transitions.iter() {
                if states[i][t.from] && t.class.contains(*byte) {
                    states[i + 1][t.to] = true;
                }
            }
            changed[i] = states[i + 1][1..].iter().any(|s| *s);
            states[i + 1][0] = !changed[i];
        }
        let match_count = states.iter().filter(|s| s[self.accept_state]).count();

        let mut consecutive = vec![true; n];
        for j in (0..n.saturating_sub(1)).rev() {
            consecutive[j] = changed[j + 1] && (states[j + 2][self.accept_state] || consecutive[j + 1]);
        }
        let mut reveal = vec![0u8; n];
        for p in 1..n {
            let on_edge = self.reveal_transitions.iter().any(|(a, b)| states[p][*a] && states[p + 1][*b]);
            if on_edge && consecutive[p - 1] {
                reveal[p] = bytes[p];
            }
        }
        DfaEval { match_count, reveal }
    }
}

/// Assigned outputs of [`RegexDfaConfig::match_bytes`].
#[derive(Debug, Clone)]
pub struct AssignedDfaResult<'v, F: PrimeField> {
    /// Number of positions at which the accept state is active.
    pub match_count: AssignedValue<'v, F>,
    /// One cell per input byte: the byte if revealed, zero otherwise.
    pub reveal: Vec<AssignedValue<'v, F>>,
}

/// Chip evaluating a [`DfaDef`] over assigned bytes.
#[derive(Debug, Clone)]
pub struct RegexDfaConfig<F: PrimeField> {
    range: RangeConfig<F>,
    def: DfaDef,
    classes: Vec<CharClass>,
    class_of_transition: Vec<usize>,
}

impl<F: PrimeField> RegexDfaConfig<F> {
    pub fn configure(range: RangeConfig<F>, def: DfaDef) -> Self {
        let (classes, class_of_transition) = def.class_table();
        log::debug!(
            "regex dfa: {} states, {} transitions, {} character classes",
            def.num_states,
            def.transitions.len(),
            classes.len()
        );
        Self {
            range,
            def,
            classes,
            class_of_transition,
        }
    }

    pub fn gate(&self) -> &FlexGateConfig<F> {
        self.range.gate()
    }

    /// Assign `bytes` zero-padded to `max_len`, each constrained to 8 bits.
    pub fn assign_bytes<'v>(
        &self,
        ctx: &mut Context<'v, F>,
        bytes: Value<&[u8]>,
        max_len: usize,
    ) -> Result<Vec<AssignedValue<'v, F>>, EmailVerifyError> {
        let mut too_long = None;
        let padded = bytes.map(|bytes| {
            if bytes.len() > max_len {
                too_long = Some(bytes.len());
            }
            crate::utils::pad_bytes(bytes, max_len)
        });
        if let Some(len) = too_long {
            return Err(EmailVerifyError::InputTooLong { name: "regex input", len, max: max_len });
        }
        let gate = self.gate();
        let assigned = (0..max_len)
            .map(|idx| {
                let byte = gate.load_witness(ctx, padded.as_ref().map(|bytes| F::from(bytes[idx] as u64)));
                self.range.range_check(ctx, &byte, 8);
                byte
            })
            .collect_vec();
        Ok(assigned)
    }

    /// Run the table over `bytes` with all states evaluated at every position.
    ///
    /// The bytes must already be constrained to 8 bits.
    pub fn match_bytes<'v>(&self, ctx: &mut Context<'v, F>, bytes: &[AssignedValue<'v, F>]) -> AssignedDfaResult<'v, F> {
        let gate = self.gate();
        let n = bytes.len();
        let num_states = self.def.num_states;
        let accept = self.def.accept_state;
        let zero = gate.load_zero(ctx);
        let one = gate.load_constant(ctx, F::one());

        let mut states = Vec::with_capacity(n + 1);
        states.push((0..num_states).map(|s| if s == 0 { one.clone() } else { zero.clone() }).collect_vec());
        let mut changed = Vec::with_capacity(n);
        for (i, byte) in bytes.iter().enumerate() {
            let mut memo = ByteMemo::default();
            let class_flags = self
                .classes
                .iter()
                .map(|class| self.class_membership(ctx, byte, class, &mut memo))
                .collect_vec();
            let mut next = vec![zero.clone(); num_states];
            for (dest, cell) in next.iter_mut().enumerate().skip(1) {
                let incoming = self
                    .def
                    .transitions
                    .iter()
                    .zip(self.class_of_transition.iter())
                    .filter(|(t, _)| t.to == dest)
                    .map(|(t, class_idx)| gate.and(ctx, Existing(&states[i][t.from]), Existing(&class_flags[*class_idx])))
                    .collect_vec();
                if !incoming.is_empty() {
                    *cell = self.multi_or(ctx, incoming);
                }
            }
            let any_fired = self.multi_or(ctx, next[1..].to_vec());
            next[0] = gate.not(ctx, Existing(&any_fired));
            changed.push(any_fired);
            states.push(next);
        }
        let match_count = gate.sum(ctx, states.iter().map(|s| Existing(&s[accept])));

        // Walking backward: is the run starting after position j unbroken up to an accept (or the end)?
        let mut consecutive = vec![one.clone(); n];
        for j in (0..n.saturating_sub(1)).rev() {
            let reaches = gate.or(ctx, Existing(&states[j + 2][accept]), Existing(&consecutive[j + 1]));
            consecutive[j] = gate.and(ctx, Existing(&changed[j + 1]), Existing(&reaches));
        }
        let mut reveal = Vec::with_capacity(n);
        if n > 0 {
            reveal.push(zero.clone());
        }
        for p in 1..n {
            let edges = self
                .def
                .reveal_transitions
                .iter()
                .map(|(a, b)| gate.and(ctx, Existing(&states[p][*a]), Existing(&states[p + 1][*b])))
                .collect_vec();
            let on_edge = self.multi_or(ctx, edges);
            let is_reveal = gate.and(ctx, Existing(&on_edge), Existing(&consecutive[p - 1]));
            reveal.push(gate.mul(ctx, Existing(&bytes[p]), Existing(&is_reveal)));
        }
        AssignedDfaResult { match_count, reveal }
    }

    /// 1 iff `byte` is in `class`. Range bounds at 0 and 255 are trivially satisfied and skipped.
    fn class_membership<'v>(
        &self,
        ctx: &mut Context<'v, F>,
        byte: &AssignedValue<'v, F>,
        class: &CharClass,
        memo: &mut ByteMemo<'v, F>,
    ) -> AssignedValue<'v, F> {
        let gate = self.gate();
        let mut terms = vec![];
        for (lo, hi) in class.ranges.iter() {
            let at_least_lo = if *lo == 0 {
                None
            } else {
                let below = memo.less_than(ctx, &self.range, byte, *lo as u64);
                Some(gate.not(ctx, Existing(&below)))
            };
            let at_most_hi = if *hi == u8::MAX {
                None
            } else {
                Some(memo.less_than(ctx, &self.range, byte, *hi as u64 + 1))
            };
            let term = match (at_least_lo, at_most_hi) {
                (Some(a), Some(b)) => gate.and(ctx, Existing(&a), Existing(&b)),
                (Some(a), None) | (None, Some(a)) => a,
                (None, None) => gate.load_constant(ctx, F::one()),
            };
            terms.push(term);
        }
        for c in class.chars.iter() {
            terms.push(memo.equal(ctx, gate, byte, *c));
        }
        self.multi_or(ctx, terms)
    }

    /// OR of boolean cells.
    fn multi_or<'v>(&self, ctx: &mut Context<'v, F>, mut bits: Vec<AssignedValue<'v, F>>) -> AssignedValue<'v, F> {
        let gate = self.gate();
        match bits.len() {
            0 => gate.load_zero(ctx),
            1 => bits.remove(0),
            2 => gate.or(ctx, Existing(&bits[0]), Existing(&bits[1])),
            _ => {
                let sum = gate.sum(ctx, bits.iter().map(Existing));
                let none = gate.is_zero(ctx, &sum);
                gate.not(ctx, Existing(&none))
            }
        }
    }
}

/// Comparison cells of one byte, shared by all character classes at the same position.
struct ByteMemo<'v, F: PrimeField> {
    equal: HashMap<u8, AssignedValue<'v, F>>,
    less_than: HashMap<u64, AssignedValue<'v, F>>,
}

impl<'v, F: PrimeField> Default for ByteMemo<'v, F> {
    fn default() -> Self {
        Self {
            equal: HashMap::new(),
            less_than: HashMap::new(),
        }
    }
}

impl<'v, F: PrimeField> ByteMemo<'v, F> {
    fn equal(&mut self, ctx: &mut Context<'v, F>, gate: &FlexGateConfig<F>, byte: &AssignedValue<'v, F>, c: u8) -> AssignedValue<'v, F> {
        self.equal
            .entry(c)
            .or_insert_with(|| gate.is_equal(ctx, Existing(byte), Constant(F::from(c as u64))))
            .clone()
    }

    fn less_than(&mut self, ctx: &mut Context<'v, F>, range: &RangeConfig<F>, byte: &AssignedValue<'v, F>, bound: u64) -> AssignedValue<'v, F> {
        self.less_than
            .entry(bound)
            .or_insert_with(|| range.is_less_than(ctx, Existing(byte), Constant(F::from(bound)), 8))
            .clone()
    }
}
