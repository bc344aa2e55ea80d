//! Per-analysis dataflow state
//!
//! One environment tracks the hints of a single running analysis: the
//! closure, every parameter and register, the accumulator, the context
//! slot, and the accumulated return value. The ephemeral slots are laid
//! out as `[ parameters | registers | accumulator | context ]`, with the
//! receiver in parameter slot 0.

use super::hints::{CompilationSubject, FunctionBlueprint, Hints, HintsVec};
use crate::bytecode::{BytecodeChunk, Register};
use crate::heap::Constant;
use std::fmt;

/// The dataflow state of one analysis.
#[derive(Debug, Clone)]
pub struct Environment {
    function: FunctionBlueprint,
    parameter_count: usize,
    register_count: usize,
    closure_hints: Hints,
    return_value_hints: Hints,
    ephemeral_hints: Vec<Hints>,
    dead: bool,
}

impl Environment {
    /// State for a top-level analysis: nothing is known about parameters
    /// or registers.
    pub fn top_level(subject: CompilationSubject, chunk: &BytecodeChunk) -> Self {
        let mut closure_hints = Hints::new();
        match subject.closure {
            Some(closure) => closure_hints.add_constant(Constant::Heap(closure)),
            None => closure_hints.add_blueprint(subject.blueprint),
        }

        let parameter_count = chunk.parameter_count as usize;
        let register_count = chunk.register_count as usize;
        Self {
            function: subject.blueprint,
            parameter_count,
            register_count,
            closure_hints,
            return_value_hints: Hints::new(),
            ephemeral_hints: vec![Hints::new(); parameter_count + register_count + 2],
            dead: false,
        }
    }

    /// State for an inlined analysis: parameter slots receive the caller's
    /// argument hints, missing parameters read as undefined, and the
    /// declared new.target register is seeded if the caller knows one.
    pub fn inlined(
        subject: CompilationSubject,
        chunk: &BytecodeChunk,
        new_target: Option<&Hints>,
        arguments: &[Hints],
    ) -> Self {
        let mut env = Self::top_level(subject, chunk);

        // Copy the hints for the actually passed arguments, at most up to
        // the parameter count.
        let param_count = env.parameter_count;
        for (slot, arg) in env.ephemeral_hints[..param_count]
            .iter_mut()
            .zip(arguments.iter())
        {
            *slot = arg.clone();
        }

        // Pad the rest with undefined.
        let undefined = Hints::constant(Constant::Undefined);
        for slot in env.ephemeral_hints[..param_count]
            .iter_mut()
            .skip(arguments.len())
        {
            *slot = undefined.clone();
        }

        if let Some(reg) = chunk.new_target_register {
            debug_assert!(env.register_hints(reg).is_empty());
            if let Some(new_target) = new_target {
                env.register_hints_mut(reg).union_from(new_target);
            }
        }

        env
    }

    /// The blueprint under analysis.
    pub fn function(&self) -> FunctionBlueprint {
        self.function
    }

    /// Hints about the closure under analysis.
    pub fn closure_hints(&self) -> &Hints {
        &self.closure_hints
    }

    /// The union of accumulator hints over every return site seen so far.
    pub fn return_value_hints(&self) -> &Hints {
        &self.return_value_hints
    }

    /// Fold the current accumulator hints into the return value.
    pub fn accumulate_return_hints(&mut self) {
        let acc = self.accumulator_hints().clone();
        self.return_value_hints.union_from(&acc);
    }

    /// Is the environment dead (unreachable code follows)?
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Drop all ephemeral state and mark the environment dead. Idempotent.
    pub fn kill(&mut self) {
        self.ephemeral_hints.clear();
        self.dead = true;
    }

    /// Restore an all-empty ephemeral layout and mark the environment
    /// alive again.
    pub fn revive(&mut self) {
        assert!(self.dead, "reviving a live environment");
        self.ephemeral_hints = vec![Hints::new(); self.ephemeral_hints_size()];
        self.dead = false;
    }

    /// Hints of the accumulator.
    pub fn accumulator_hints(&self) -> &Hints {
        &self.ephemeral_hints[self.accumulator_index()]
    }

    /// Mutable hints of the accumulator.
    pub fn accumulator_hints_mut(&mut self) -> &mut Hints {
        let index = self.accumulator_index();
        &mut self.ephemeral_hints[index]
    }

    /// Hints of a register. The function-closure pseudo-register reads the
    /// closure hints; the context pseudo-register reads the context slot.
    pub fn register_hints(&self, reg: Register) -> &Hints {
        if reg.is_function_closure() {
            return &self.closure_hints;
        }
        &self.ephemeral_hints[self.register_to_slot_index(reg)]
    }

    /// Mutable hints of a register. The function-closure pseudo-register
    /// is read-only for transfer functions.
    pub fn register_hints_mut(&mut self, reg: Register) -> &mut Hints {
        assert!(
            !reg.is_function_closure(),
            "closure hints are immutable after construction"
        );
        let index = self.register_to_slot_index(reg);
        &mut self.ephemeral_hints[index]
    }

    /// Hints of the context slot.
    pub fn context_hints(&self) -> &Hints {
        &self.ephemeral_hints[self.context_index()]
    }

    /// Empty every ephemeral hint set, keeping closure and return-value
    /// hints.
    pub fn clear_ephemeral_hints(&mut self) {
        for hints in &mut self.ephemeral_hints {
            hints.clear();
        }
    }

    /// Append the hints of `count` consecutive registers starting at
    /// `first` onto `dst`.
    pub fn export_register_hints(&self, first: Register, count: usize, dst: &mut HintsVec) {
        for i in 0..count {
            dst.push(self.register_hints(first.offset(i)).clone());
        }
    }

    /// Union-merge `other` into this environment at a control-flow join.
    ///
    /// Both environments come from the same function, so the layouts must
    /// agree. A dead environment adopts the other's ephemeral state
    /// wholesale.
    pub fn merge(&mut self, other: &Environment) {
        assert_eq!(self.parameter_count, other.parameter_count);
        assert_eq!(self.register_count, other.register_count);
        debug_assert!(
            self.closure_hints == other.closure_hints,
            "merging environments of different closures"
        );

        if self.dead {
            assert!(!other.dead, "merging two dead environments");
            self.ephemeral_hints = other.ephemeral_hints.clone();
            self.dead = false;
            self.return_value_hints.union_from(&other.return_value_hints);
            return;
        }

        assert_eq!(self.ephemeral_hints.len(), other.ephemeral_hints.len());
        for (ours, theirs) in self
            .ephemeral_hints
            .iter_mut()
            .zip(other.ephemeral_hints.iter())
        {
            ours.union_from(theirs);
        }
        self.return_value_hints.union_from(&other.return_value_hints);
    }

    fn register_to_slot_index(&self, reg: Register) -> usize {
        if reg.is_current_context() {
            return self.context_index();
        }
        let index = reg.index();
        assert!(
            index < self.parameter_count + self.register_count,
            "register out of frame"
        );
        index
    }

    fn accumulator_index(&self) -> usize {
        self.parameter_count + self.register_count
    }

    fn context_index(&self) -> usize {
        self.accumulator_index() + 1
    }

    fn ephemeral_hints_size(&self) -> usize {
        self.context_index() + 1
    }

    #[cfg(test)]
    pub(crate) fn ephemeral_len(&self) -> usize {
        self.ephemeral_hints.len()
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dead {
            writeln!(f, "dead")?;
        } else {
            writeln!(f, "alive")?;
            for (i, hints) in self.ephemeral_hints.iter().enumerate() {
                if hints.is_empty() {
                    continue;
                }
                if i < self.parameter_count {
                    writeln!(f, "hints for a{}:", i)?;
                } else if i < self.parameter_count + self.register_count {
                    writeln!(f, "hints for r{}:", i - self.parameter_count)?;
                } else if i == self.accumulator_index() {
                    writeln!(f, "hints for <accumulator>:")?;
                } else {
                    writeln!(f, "hints for <context>:")?;
                }
                write!(f, "{}", hints)?;
            }
        }
        if !self.closure_hints.is_empty() {
            writeln!(f, "hints for <closure>:")?;
            write!(f, "{}", self.closure_hints)?;
        }
        if !self.return_value_hints.is_empty() {
            writeln!(f, "hints for {{return value}}:")?;
            write!(f, "{}", self.return_value_hints)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{SharedId, VectorId};

    fn blueprint() -> FunctionBlueprint {
        FunctionBlueprint::new(SharedId(0), VectorId(0))
    }

    fn chunk(params: u8, regs: u8) -> BytecodeChunk {
        BytecodeChunk::new(params, regs)
    }

    fn top_level_env(params: u8, regs: u8) -> Environment {
        Environment::top_level(
            CompilationSubject::for_blueprint(blueprint()),
            &chunk(params, regs),
        )
    }

    #[test]
    fn test_layout_size() {
        let env = top_level_env(2, 3);
        assert_eq!(env.ephemeral_len(), 2 + 3 + 2);
    }

    #[test]
    fn test_closure_hints_from_blueprint() {
        let env = top_level_env(1, 0);
        assert!(env.closure_hints().blueprints().contains(&blueprint()));
    }

    #[test]
    fn test_inlined_seeding_and_padding() {
        let args = vec![Hints::constant(Constant::Smi(1))];
        let env = Environment::inlined(
            CompilationSubject::for_blueprint(blueprint()),
            &chunk(3, 1),
            None,
            &args,
        );

        let receiver = env.register_hints(Register::new(0));
        assert!(receiver.constants().contains(&Constant::Smi(1)));
        // Unsupplied parameters read as exactly {undefined}.
        for i in 1..3 {
            let hints = env.register_hints(Register::new(i));
            assert_eq!(hints.constants().len(), 1);
            assert!(hints.constants().contains(&Constant::Undefined));
        }
        // Locals stay empty.
        assert!(env.register_hints(Register::new(3)).is_empty());
    }

    #[test]
    fn test_extra_arguments_are_dropped() {
        let args = vec![
            Hints::constant(Constant::Smi(1)),
            Hints::constant(Constant::Smi(2)),
            Hints::constant(Constant::Smi(3)),
        ];
        let env = Environment::inlined(
            CompilationSubject::for_blueprint(blueprint()),
            &chunk(2, 0),
            None,
            &args,
        );
        assert!(env
            .register_hints(Register::new(1))
            .constants()
            .contains(&Constant::Smi(2)));
        assert_eq!(env.ephemeral_len(), 2 + 2);
    }

    #[test]
    fn test_new_target_seeding() {
        let mut c = chunk(1, 1);
        c.new_target_register = Some(c.local(0));
        let new_target = Hints::constant(Constant::Smi(7));
        let env = Environment::inlined(
            CompilationSubject::for_blueprint(blueprint()),
            &c,
            Some(&new_target),
            &[],
        );
        assert!(env
            .register_hints(c.local(0))
            .constants()
            .contains(&Constant::Smi(7)));
    }

    #[test]
    fn test_kill_then_revive_restores_layout() {
        let mut env = top_level_env(2, 2);
        let before = env.ephemeral_len();
        env.kill();
        assert!(env.is_dead());
        env.kill(); // idempotent
        env.revive();
        assert!(!env.is_dead());
        assert_eq!(env.ephemeral_len(), before);
        assert!(env.accumulator_hints().is_empty());
    }

    #[test]
    fn test_merge_is_pointwise_superset() {
        let mut a = top_level_env(1, 1);
        let mut b = top_level_env(1, 1);
        a.accumulator_hints_mut().add_constant(Constant::Smi(1));
        b.accumulator_hints_mut().add_constant(Constant::Smi(2));
        let a_before = a.clone();

        a.merge(&b);
        assert!(a.accumulator_hints().includes(a_before.accumulator_hints()));
        assert!(a.accumulator_hints().includes(b.accumulator_hints()));
    }

    #[test]
    fn test_merge_self_is_identity() {
        let mut env = top_level_env(1, 1);
        env.accumulator_hints_mut().add_constant(Constant::Smi(3));
        env.register_hints_mut(Register::new(1))
            .add_shape(crate::heap::ShapeId(4));
        let snapshot = env.clone();
        env.merge(&snapshot);
        assert_eq!(
            env.accumulator_hints(),
            snapshot.accumulator_hints()
        );
        assert_eq!(
            env.register_hints(Register::new(1)),
            snapshot.register_hints(Register::new(1))
        );
    }

    #[test]
    fn test_deep_copy_then_merge_is_identity() {
        let mut env = top_level_env(1, 2);
        env.accumulator_hints_mut().add_constant(Constant::Null);
        let copy = env.clone();
        let mut merged = copy.clone();
        merged.merge(&env);
        assert_eq!(merged.accumulator_hints(), env.accumulator_hints());
    }

    #[test]
    fn test_dead_merge_adopts_other() {
        let mut dead = top_level_env(1, 1);
        dead.kill();
        let mut live = top_level_env(1, 1);
        live.accumulator_hints_mut().add_constant(Constant::Smi(9));

        dead.merge(&live);
        assert!(!dead.is_dead());
        assert!(dead.accumulator_hints().constants().contains(&Constant::Smi(9)));
    }

    #[test]
    fn test_closure_register_maps_to_closure_hints() {
        let env = top_level_env(1, 0);
        assert_eq!(
            env.register_hints(Register::FUNCTION_CLOSURE),
            env.closure_hints()
        );
    }

    #[test]
    #[should_panic]
    fn test_closure_register_is_read_only() {
        let mut env = top_level_env(1, 0);
        env.register_hints_mut(Register::FUNCTION_CLOSURE);
    }

    #[test]
    fn test_clear_ephemeral_preserves_closure_and_return() {
        let mut env = top_level_env(1, 1);
        env.accumulator_hints_mut().add_constant(Constant::Smi(1));
        env.accumulate_return_hints();
        env.clear_ephemeral_hints();
        assert!(env.accumulator_hints().is_empty());
        assert!(!env.return_value_hints().is_empty());
        assert!(!env.closure_hints().is_empty());
    }

    #[test]
    fn test_export_register_hints_appends() {
        let mut env = top_level_env(1, 3);
        env.register_hints_mut(Register::new(1))
            .add_constant(Constant::Smi(1));
        env.register_hints_mut(Register::new(2))
            .add_constant(Constant::Smi(2));

        let mut dst = HintsVec::new();
        dst.push(Hints::constant(Constant::Undefined));
        env.export_register_hints(Register::new(1), 2, &mut dst);
        assert_eq!(dst.len(), 3);
        assert!(dst[1].constants().contains(&Constant::Smi(1)));
        assert!(dst[2].constants().contains(&Constant::Smi(2)));
    }
}
