//! The speculation engine
//!
//! This module implements the forward abstract interpretation that threads
//! hint sets through a function's bytecode ahead of optimized compilation.
//! Alongside the dataflow itself, every transfer function eagerly copies
//! the runtime metadata the optimizer might later need into the broker's
//! side store, because the optimizer runs on a thread that must not touch
//! the heap.
//!
//! The walk is a single forward pass: hint sets grow monotonically at
//! joins and all transfer functions are conservative, so no fixpoint
//! iteration is needed. Call sites whose callee is concretely known
//! recurse into a child analysis of the callee and fold its return hints
//! back into the accumulator.

mod environment;
mod hints;

pub use environment::Environment;
pub use hints::{CompilationSubject, FunctionBlueprint, Hints, HintsVec};

use crate::broker::{
    AccessInfoFactory, AccessMode, ElementAccessFeedback, FeedbackSource, GlobalAccessFeedback,
    HeapBroker, NamedAccessFeedback, ProcessedFeedback,
};
use crate::bytecode::{BytecodeChunk, BytecodeIterator, Opcode, Register};
use crate::error::SpeculationError;
use crate::heap::feedback::{FeedbackSlot, IcState, KeyType};
use crate::heap::{Builtin, Constant, NameId, ObjectId, ShapeId, SharedId, TemplateId};
use rustc_hash::FxHashMap;
use smallvec::smallvec;
use tracing::trace;

/// Switches controlling one analysis.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerializerFlags {
    /// Kill the environment at sites whose feedback is uninitialized
    pub bailout_on_uninitialized: bool,
    /// Collect source positions for every analyzed function
    pub collect_source_positions: bool,
    /// The compilation replaces a running activation
    pub osr: bool,
}

impl SerializerFlags {
    fn without_osr(self) -> Self {
        Self { osr: false, ..self }
    }
}

/// How a variadic call site treats its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiverMode {
    /// The receiver is implicitly undefined
    NullOrUndefined,
    /// The receiver is the first register of the range
    Any,
}

/// Tracks which offsets begin an exception handler, in walk order.
struct ExceptionHandlerTargets {
    handlers: Vec<usize>,
    cursor: usize,
}

impl ExceptionHandlerTargets {
    fn new(chunk: &BytecodeChunk) -> Self {
        let mut handlers: Vec<usize> = chunk.handler_table.iter().map(|r| r.handler).collect();
        handlers.sort_unstable();
        handlers.dedup();
        Self {
            handlers,
            cursor: 0,
        }
    }

    /// Does `offset` begin a handler? Offsets must be queried in
    /// non-decreasing order.
    fn is_handler_start(&mut self, offset: usize) -> bool {
        while self.cursor < self.handlers.len() && self.handlers[self.cursor] < offset {
            self.cursor += 1;
        }
        self.cursor < self.handlers.len() && self.handlers[self.cursor] == offset
    }
}

/// The abstract interpreter of one function.
///
/// Hint sets for registers, the accumulator and the return value are
/// threaded through a forward walk of the bytecode; metadata needed later
/// is materialized through the broker as a side effect.
pub struct HintSerializer<'h, 'b> {
    broker: &'b mut HeapBroker<'h>,
    env: Environment,
    jump_target_envs: FxHashMap<usize, Environment>,
    flags: SerializerFlags,
}

impl<'h, 'b> HintSerializer<'h, 'b> {
    /// A top-level analysis of a concrete closure.
    ///
    /// The closure must have run at least once: analysis needs its
    /// feedback vector and its bytecode.
    pub fn for_closure(
        broker: &'b mut HeapBroker<'h>,
        closure: ObjectId,
        flags: SerializerFlags,
    ) -> Result<Self, SpeculationError> {
        let heap = broker.heap();
        let Some((object, shared, feedback)) = heap.as_function(Constant::Heap(closure)) else {
            return Err(SpeculationError::NotAFunction);
        };
        let feedback = feedback.ok_or(SpeculationError::MissingFeedbackVector)?;
        let chunk = heap
            .shared(shared)
            .bytecode
            .as_ref()
            .ok_or(SpeculationError::MissingBytecode)?;

        let subject = CompilationSubject::for_closure(FunctionBlueprint::new(shared, feedback), object);
        broker.record_function(object);
        Ok(Self {
            broker,
            env: Environment::top_level(subject, chunk),
            jump_target_envs: FxHashMap::default(),
            flags,
        })
    }

    /// An inlined analysis, seeded with the caller's argument hints.
    fn inlined(
        broker: &'b mut HeapBroker<'h>,
        subject: CompilationSubject,
        new_target: Option<Hints>,
        arguments: &[Hints],
        flags: SerializerFlags,
    ) -> Self {
        assert!(!flags.osr, "an inlined activation cannot be replaced on stack");
        let chunk = broker
            .heap()
            .shared(subject.blueprint.shared)
            .bytecode
            .as_ref()
            .expect("inlineable function without bytecode");
        let env = Environment::inlined(subject, chunk, new_target.as_ref(), arguments);
        if let Some(closure) = subject.closure {
            broker.record_function(closure);
        }
        Self {
            broker,
            env,
            jump_target_envs: FxHashMap::default(),
            flags,
        }
    }

    /// Run the analysis and return the function's return-value hints.
    ///
    /// Each `(shared, vector)` pair is walked at most once per
    /// compilation; a repeated run returns no hints.
    pub fn run(&mut self) -> Hints {
        let blueprint = self.env.function();
        let _span = tracing::trace_span!(
            "analyze",
            function = %self.broker.heap().shared(blueprint.shared).name
        )
        .entered();

        if self
            .broker
            .is_serialized_for_compilation(blueprint.shared, blueprint.feedback)
        {
            trace!("already analyzed, bailing out");
            return Hints::new();
        }
        self.broker
            .set_serialized_for_compilation(blueprint.shared, blueprint.feedback);

        if self.flags.collect_source_positions {
            self.broker.record_source_positions(blueprint.shared);
        }
        self.broker.record_vector_slots(blueprint.feedback);

        self.traverse_bytecode();
        self.env.return_value_hints().clone()
    }

    /// The environment, for inspection after a run.
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    fn chunk(&self) -> &'h BytecodeChunk {
        self.broker
            .heap()
            .shared(self.env.function().shared)
            .bytecode
            .as_ref()
            .expect("analyzed function lost its bytecode")
    }

    // ---------------------------------------------------------------
    // The walk
    // ---------------------------------------------------------------

    fn traverse_bytecode(&mut self) {
        let chunk = self.chunk();
        let mut iterator = BytecodeIterator::new(chunk);
        let mut handlers = ExceptionHandlerTargets::new(chunk);

        while !iterator.done() {
            let offset = iterator.current_offset();
            self.incorporate_jump_target_environment(offset);

            trace!(offset, opcode = ?iterator.current_opcode(), "visit");
            trace!(environment = %self.env, "current environment");

            if self.env.is_dead() {
                let revives = matches!(iterator.current_opcode(), Some(Opcode::ResumeGenerator))
                    || handlers.is_handler_start(offset);
                if revives {
                    self.env.revive();
                } else {
                    // No code will be generated here.
                    iterator.advance();
                    continue;
                }
            }

            match iterator.current_opcode() {
                Some(op) => self.dispatch(op, &iterator),
                // An undecodable byte loses all ephemeral knowledge.
                None => self.env.clear_ephemeral_hints(),
            }
            iterator.advance();
        }
    }

    fn dispatch(&mut self, op: Opcode, it: &BytecodeIterator) {
        match op {
            // -------- constants into the accumulator --------
            Opcode::LdaUndefined => self.load_constant(Constant::Undefined),
            Opcode::LdaNull => self.load_constant(Constant::Null),
            Opcode::LdaTrue => self.load_constant(Constant::Bool(true)),
            Opcode::LdaFalse => self.load_constant(Constant::Bool(false)),
            Opcode::LdaTheHole => self.load_constant(Constant::TheHole),
            Opcode::LdaZero => self.load_constant(Constant::Smi(0)),
            Opcode::LdaSmi => self.load_constant(Constant::Smi(it.immediate_operand(0) as i32)),
            Opcode::LdaConstant => {
                let constant = *self
                    .chunk()
                    .get_constant(it.constant_index_operand(0))
                    .expect("constant index outside pool");
                self.load_constant(constant);
            }

            // -------- moves --------
            Opcode::Ldar => {
                let src = self.env.register_hints(it.register_operand(0)).clone();
                let acc = self.env.accumulator_hints_mut();
                acc.clear();
                acc.union_from(&src);
            }
            Opcode::Star => {
                let acc = self.env.accumulator_hints().clone();
                let dst = self.env.register_hints_mut(it.register_operand(0));
                dst.clear();
                dst.union_from(&acc);
            }
            Opcode::Mov => {
                let src = self.env.register_hints(it.register_operand(0)).clone();
                let dst = self.env.register_hints_mut(it.register_operand(1));
                dst.clear();
                dst.union_from(&src);
            }

            // -------- closures --------
            Opcode::CreateClosure => self.visit_create_closure(it),
            Opcode::GetSuperConstructor => self.visit_get_super_constructor(it),

            // -------- globals --------
            Opcode::LdaGlobal | Opcode::LdaGlobalInsideTypeof => self.visit_lda_global(it),
            Opcode::StaGlobal => {
                let slot = it.slot_operand(1);
                self.process_feedback_for_global_access(slot);
            }

            // -------- named properties --------
            Opcode::GetNamedProperty => self.visit_named_access(it, AccessMode::Load),
            Opcode::SetNamedProperty => self.visit_named_access(it, AccessMode::Store),
            Opcode::DefineNamedOwnProperty => self.visit_named_access(it, AccessMode::StoreInLiteral),

            // -------- keyed properties --------
            Opcode::GetKeyedProperty => {
                let receiver = self.env.register_hints(it.register_operand(0)).clone();
                let key = self.env.accumulator_hints().clone();
                let slot = it.slot_operand(1);
                self.process_keyed_property_access(&receiver, &key, slot, AccessMode::Load);
            }
            Opcode::TestIn => {
                let receiver = self.env.accumulator_hints().clone();
                let key = self.env.register_hints(it.register_operand(0)).clone();
                let slot = it.slot_operand(1);
                self.process_keyed_property_access(&receiver, &key, slot, AccessMode::Has);
            }
            Opcode::SetKeyedProperty => {
                let receiver = self.env.register_hints(it.register_operand(0)).clone();
                let key = self.env.register_hints(it.register_operand(1)).clone();
                let slot = it.slot_operand(2);
                self.process_keyed_property_access(&receiver, &key, slot, AccessMode::Store);
            }
            Opcode::StaInArrayLiteral => {
                let receiver = self.env.register_hints(it.register_operand(0)).clone();
                let key = self.env.register_hints(it.register_operand(1)).clone();
                let slot = it.slot_operand(2);
                self.process_keyed_property_access(&receiver, &key, slot, AccessMode::StoreInLiteral);
            }

            // -------- calls --------
            Opcode::CallAnyReceiver => self.process_call_varargs(it, ReceiverMode::Any, false),
            Opcode::CallProperty => {
                self.process_call_varargs(it, ReceiverMode::NullOrUndefined, false)
            }
            Opcode::CallUndefinedReceiver => {
                self.process_call_varargs(it, ReceiverMode::NullOrUndefined, false)
            }
            Opcode::CallWithSpread => self.process_call_varargs(it, ReceiverMode::Any, true),
            Opcode::CallProperty0 => {
                let callee = self.env.register_hints(it.register_operand(0)).clone();
                let receiver = self.env.register_hints(it.register_operand(1)).clone();
                let slot = it.slot_operand(2);
                self.process_call_or_construct(callee, None, smallvec![receiver], slot, false);
            }
            Opcode::CallProperty1 => {
                let callee = self.env.register_hints(it.register_operand(0)).clone();
                let receiver = self.env.register_hints(it.register_operand(1)).clone();
                let arg0 = self.env.register_hints(it.register_operand(2)).clone();
                let slot = it.slot_operand(3);
                self.process_call_or_construct(callee, None, smallvec![receiver, arg0], slot, false);
            }
            Opcode::CallProperty2 => {
                let callee = self.env.register_hints(it.register_operand(0)).clone();
                let receiver = self.env.register_hints(it.register_operand(1)).clone();
                let arg0 = self.env.register_hints(it.register_operand(2)).clone();
                let arg1 = self.env.register_hints(it.register_operand(3)).clone();
                let slot = it.slot_operand(4);
                self.process_call_or_construct(
                    callee,
                    None,
                    smallvec![receiver, arg0, arg1],
                    slot,
                    false,
                );
            }
            Opcode::CallUndefinedReceiver0 => {
                let callee = self.env.register_hints(it.register_operand(0)).clone();
                let slot = it.slot_operand(1);
                let receiver = Hints::constant(Constant::Undefined);
                self.process_call_or_construct(callee, None, smallvec![receiver], slot, false);
            }
            Opcode::CallUndefinedReceiver1 => {
                let callee = self.env.register_hints(it.register_operand(0)).clone();
                let arg0 = self.env.register_hints(it.register_operand(1)).clone();
                let slot = it.slot_operand(2);
                let receiver = Hints::constant(Constant::Undefined);
                self.process_call_or_construct(callee, None, smallvec![receiver, arg0], slot, false);
            }
            Opcode::CallUndefinedReceiver2 => {
                let callee = self.env.register_hints(it.register_operand(0)).clone();
                let arg0 = self.env.register_hints(it.register_operand(1)).clone();
                let arg1 = self.env.register_hints(it.register_operand(2)).clone();
                let slot = it.slot_operand(3);
                let receiver = Hints::constant(Constant::Undefined);
                self.process_call_or_construct(
                    callee,
                    None,
                    smallvec![receiver, arg0, arg1],
                    slot,
                    false,
                );
            }
            Opcode::CallRuntime => self.env.clear_ephemeral_hints(),

            // -------- construction --------
            Opcode::Construct => self.visit_construct(it, false),
            Opcode::ConstructWithSpread => self.visit_construct(it, true),

            // -------- control flow --------
            Opcode::Jump | Opcode::JumpLoop => {
                self.process_jump(it);
                // Fallthrough is impossible.
                self.env.clear_ephemeral_hints();
            }
            Opcode::JumpIfTrue
            | Opcode::JumpIfFalse
            | Opcode::JumpIfNull
            | Opcode::JumpIfNotNull
            | Opcode::JumpIfUndefined
            | Opcode::JumpIfNotUndefined => self.process_jump(it),
            Opcode::SwitchOnSmiNoFeedback => {
                for target in it.jump_table_targets() {
                    self.contribute_to_jump_target_environment(target);
                }
            }

            // -------- contexts --------
            Opcode::PushContext => {
                let saved = it.register_operand(0);
                let old_context = self.env.register_hints(Register::CURRENT_CONTEXT).clone();
                let dst = self.env.register_hints_mut(saved);
                dst.clear();
                dst.union_from(&old_context);

                let acc = self.env.accumulator_hints().clone();
                let context = self.env.register_hints_mut(Register::CURRENT_CONTEXT);
                context.clear();
                context.union_from(&acc);
            }
            Opcode::PopContext => {
                let saved = self.env.register_hints(it.register_operand(0)).clone();
                let context = self.env.register_hints_mut(Register::CURRENT_CONTEXT);
                context.clear();
                context.union_from(&saved);
            }

            // -------- termination --------
            Opcode::Return => {
                self.env.accumulate_return_hints();
                self.env.clear_ephemeral_hints();
            }
            Opcode::Throw | Opcode::ReThrow | Opcode::Abort | Opcode::SuspendGenerator => {
                self.env.kill();
            }
            // The resumed frame's register state is unknown.
            Opcode::ResumeGenerator => self.env.clear_ephemeral_hints(),

            // -------- hint-free operations --------
            Opcode::Nop | Opcode::StackCheck => {}

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::BitwiseAnd
            | Opcode::BitwiseOr
            | Opcode::BitwiseXor
            | Opcode::ShiftLeft
            | Opcode::ShiftRight
            | Opcode::Inc
            | Opcode::Dec
            | Opcode::Negate
            | Opcode::BitwiseNot
            | Opcode::ToNumber
            | Opcode::TypeOf
            | Opcode::LogicalNot
            | Opcode::TestEqual
            | Opcode::TestEqualStrict
            | Opcode::TestLessThan
            | Opcode::TestGreaterThan
            | Opcode::TestLessThanOrEqual
            | Opcode::TestGreaterThanOrEqual
            | Opcode::TestInstanceOf
            | Opcode::TestNull
            | Opcode::TestUndefined => self.env.accumulator_hints_mut().clear(),

            Opcode::Illegal => unreachable!("illegal opcode reached the walk"),
        }
    }

    fn load_constant(&mut self, constant: Constant) {
        let acc = self.env.accumulator_hints_mut();
        acc.clear();
        acc.add_constant(constant);
    }

    fn name_constant(&self, index: u16) -> NameId {
        match self.chunk().get_constant(index) {
            Some(Constant::Str(name)) => *name,
            other => panic!("expected a name constant, found {:?}", other),
        }
    }

    // ---------------------------------------------------------------
    // Closures
    // ---------------------------------------------------------------

    fn visit_create_closure(&mut self, it: &BytecodeIterator) {
        let shared = match self.chunk().get_constant(it.constant_index_operand(0)) {
            Some(Constant::Shared(shared)) => *shared,
            other => panic!("expected a shared-info constant, found {:?}", other),
        };
        let cell_index = it.cell_index_operand(1);

        self.env.accumulator_hints_mut().clear();
        let vector = self.broker.heap().vector(self.env.function().feedback);
        let cell_vector = vector
            .closure_cells
            .get(cell_index)
            .and_then(|cell| cell.vector);
        // Without a vector in the cell, the closure-to-be has no usable
        // identity yet.
        if let Some(feedback) = cell_vector {
            self.env
                .accumulator_hints_mut()
                .add_blueprint(FunctionBlueprint::new(shared, feedback));
        }
    }

    fn visit_get_super_constructor(&mut self, it: &BytecodeIterator) {
        let dst = it.register_operand(0);
        self.env.register_hints_mut(dst).clear();

        let heap = self.broker.heap();
        let constants: Vec<Constant> = self
            .env
            .accumulator_hints()
            .constants()
            .iter()
            .copied()
            .collect();
        for constant in constants {
            let Some((object, _, _)) = heap.as_function(constant) else {
                continue;
            };
            let shape = heap.object(object).shape;
            self.broker.record_shape_prototype(shape);
            let Some(proto) = heap.shape(shape).prototype else {
                continue;
            };
            if heap.shape(heap.object(proto).shape).is_constructor {
                self.env
                    .register_hints_mut(dst)
                    .add_constant(Constant::Heap(proto));
            }
        }
    }

    // ---------------------------------------------------------------
    // Globals
    // ---------------------------------------------------------------

    fn visit_lda_global(&mut self, it: &BytecodeIterator) {
        let slot = it.slot_operand(1);
        self.env.accumulator_hints_mut().clear();
        if let Some(feedback) = self.process_feedback_for_global_access(slot) {
            if let Some(constant) = feedback.constant_hint() {
                self.env.accumulator_hints_mut().add_constant(constant);
            }
        }
    }

    fn process_feedback_for_global_access(
        &mut self,
        slot: FeedbackSlot,
    ) -> Option<GlobalAccessFeedback> {
        if slot.is_invalid() {
            return None;
        }
        let source = FeedbackSource::new(self.env.function().feedback, slot);
        if self.broker.has_feedback(source) {
            return match self.broker.get_feedback(source) {
                Some(ProcessedFeedback::Global(feedback)) => Some(feedback.clone()),
                _ => None,
            };
        }
        let feedback = self.broker.derive_global_access_feedback(source);
        self.broker
            .set_feedback(source, ProcessedFeedback::Global(feedback.clone()));
        Some(feedback)
    }

    // ---------------------------------------------------------------
    // Property access
    // ---------------------------------------------------------------

    fn visit_named_access(&mut self, it: &BytecodeIterator, mode: AccessMode) {
        let receiver = self.env.register_hints(it.register_operand(0)).clone();
        let name = self.name_constant(it.constant_index_operand(1));
        let slot = it.slot_operand(2);
        self.process_named_property_access(&receiver, name, slot, mode);
    }

    fn process_named_property_access(
        &mut self,
        receiver: &Hints,
        name: NameId,
        slot: FeedbackSlot,
        mode: AccessMode,
    ) {
        if self.bailout_on_uninitialized(slot) {
            return;
        }
        self.process_feedback_for_property_access(slot, mode, Some(name));

        let heap = self.broker.heap();
        for shape in self
            .broker
            .relevant_receiver_shapes(receiver.shapes().iter().copied())
        {
            self.process_shape_for_named_access(shape, name);
        }

        let global_proxy = heap.native_context().global_proxy;
        for constant in receiver.constants().iter().copied() {
            if constant == Constant::Heap(global_proxy) {
                if let Some(cell) = heap.global_cell(name) {
                    self.broker.record_property_cell(name, cell);
                }
            }
            // Loading "prototype" off a constant function pins the whole
            // function.
            if mode == AccessMode::Load && name == heap.names.well_known().prototype {
                if let Some((object, _, _)) = heap.as_function(constant) {
                    self.broker.record_function(object);
                }
            }
        }

        self.env.accumulator_hints_mut().clear();
    }

    fn process_shape_for_named_access(&mut self, shape: ShapeId, name: NameId) {
        let heap = self.broker.heap();
        let proxy_shape = heap.object(heap.native_context().global_proxy).shape;
        if shape == proxy_shape {
            if let Some(cell) = heap.global_cell(name) {
                self.broker.record_property_cell(name, cell);
            }
        }
    }

    fn process_keyed_property_access(
        &mut self,
        receiver: &Hints,
        key: &Hints,
        slot: FeedbackSlot,
        mode: AccessMode,
    ) {
        if self.bailout_on_uninitialized(slot) {
            return;
        }
        self.process_feedback_for_property_access(slot, mode, None);

        let heap = self.broker.heap();
        for constant in receiver.constants().iter().copied() {
            let Constant::Heap(object) = constant else {
                continue;
            };
            if heap.is_typed_array(object) {
                self.broker.record_typed_array(object);
            }
            if matches!(mode, AccessMode::Load | AccessMode::Has) {
                for key_constant in key.constants().iter().copied() {
                    let Constant::Smi(index) = key_constant else {
                        continue;
                    };
                    if index < 0 {
                        continue;
                    }
                    let index = index as u32;
                    let element = self.broker.get_own_constant_element(object, index);
                    if element.is_none() && heap.is_array(object) {
                        // A copy-on-write store still pins the element:
                        // any write replaces the whole backing store.
                        self.broker.get_own_cow_element(object, index);
                    }
                }
            }
        }

        self.env.accumulator_hints_mut().clear();
    }

    fn process_feedback_for_property_access(
        &mut self,
        slot: FeedbackSlot,
        mode: AccessMode,
        static_name: Option<NameId>,
    ) {
        if slot.is_invalid() {
            return;
        }
        let source = FeedbackSource::new(self.env.function().feedback, slot);
        if self.broker.has_feedback(source) {
            return;
        }

        let nexus = self.broker.nexus(source);
        if nexus.is_uninitialized() {
            self.broker
                .set_feedback(source, ProcessedFeedback::Insufficient);
            return;
        }

        let raw_shapes: Vec<ShapeId> = nexus.extract_shapes().to_vec();
        if raw_shapes.is_empty() {
            // Megamorphic: no shapes to specialize on.
            self.broker
                .set_feedback(source, ProcessedFeedback::Megamorphic);
            return;
        }

        let ic_state = nexus.ic_state();
        let key_type = nexus.key_type();
        let name = static_name.or_else(|| nexus.name_feedback());

        let shapes = self.broker.relevant_receiver_shapes(raw_shapes);
        if shapes.is_empty() {
            self.broker
                .set_feedback(source, ProcessedFeedback::Insufficient);
            return;
        }

        let processed = if let Some(name) = name {
            let mut access_infos = Vec::new();
            for &shape in &shapes {
                self.process_shape_for_named_access(shape, name);
                let factory = AccessInfoFactory::new(self.broker.heap());
                access_infos.push(factory.compute_property_access_info(shape, name, mode));
            }
            assert!(!access_infos.is_empty());
            ProcessedFeedback::NamedAccess(NamedAccessFeedback { name, access_infos })
        } else if key_type == KeyType::Element && ic_state != IcState::Megamorphic {
            for &shape in &shapes {
                match mode {
                    AccessMode::Load | AccessMode::Has => self.broker.record_element_load(shape),
                    AccessMode::Store => self.broker.record_element_store(shape),
                    // Local and simple, nothing to materialize.
                    AccessMode::StoreInLiteral => {}
                }
            }
            ProcessedFeedback::ElementAccess(ElementAccessFeedback { shapes })
        } else {
            ProcessedFeedback::Megamorphic
        };
        self.broker.set_feedback(source, processed);
    }

    // ---------------------------------------------------------------
    // Calls and construction
    // ---------------------------------------------------------------

    fn process_call_varargs(
        &mut self,
        it: &BytecodeIterator,
        receiver_mode: ReceiverMode,
        with_spread: bool,
    ) {
        let callee = self.env.register_hints(it.register_operand(0)).clone();
        let first = it.register_operand(1);
        let count = it.register_count_operand(2);
        let slot = it.slot_operand(3);

        let mut arguments = HintsVec::new();
        // The receiver is either given in the register range or it is
        // implicitly undefined.
        if receiver_mode == ReceiverMode::NullOrUndefined {
            arguments.push(Hints::constant(Constant::Undefined));
        }
        self.env.export_register_hints(first, count, &mut arguments);

        self.process_call_or_construct(callee, None, arguments, slot, with_spread);
    }

    fn visit_construct(&mut self, it: &BytecodeIterator, with_spread: bool) {
        let callee = self.env.register_hints(it.register_operand(0)).clone();
        let first = it.register_operand(1);
        let count = it.register_count_operand(2);
        let slot = it.slot_operand(3);
        let new_target = self.env.accumulator_hints().clone();

        let mut arguments = HintsVec::new();
        self.env.export_register_hints(first, count, &mut arguments);

        self.process_call_or_construct(callee, Some(new_target), arguments, slot, with_spread);
    }

    fn process_call_or_construct(
        &mut self,
        mut callee: Hints,
        mut new_target: Option<Hints>,
        arguments: HintsVec,
        slot: FeedbackSlot,
        with_spread: bool,
    ) {
        if self.bailout_on_uninitialized(slot) {
            return;
        }

        // Enrich the static hints with the profiled target before any
        // inlining decision.
        if !slot.is_invalid() {
            let source = FeedbackSource::new(self.env.function().feedback, slot);
            let nexus = self.broker.nexus(source);
            if !nexus.is_uninitialized() {
                if let Some(target) = nexus.heap_object_feedback() {
                    if self.broker.heap().is_callable(target) {
                        match new_target.as_mut() {
                            // Construct: the profiled object is new.target,
                            // which usually is also the callee.
                            Some(new_target) => {
                                new_target.add_constant(Constant::Heap(target));
                                callee.add_constant(Constant::Heap(target));
                            }
                            None => callee.add_constant(Constant::Heap(target)),
                        }
                    }
                }
            }
        }

        self.env.accumulator_hints_mut().clear();

        let heap = self.broker.heap();
        for constant in callee.constants().iter().copied() {
            let Some((object, shared_id, feedback)) = heap.as_function(constant) else {
                continue;
            };
            let shared = heap.shared(shared_id);

            if shared.is_api_function() {
                self.process_api_call(shared_id, &arguments);
                debug_assert!(!shared.inlineable);
            } else if shared.has_builtin_id() {
                self.process_builtin_call(shared_id, &arguments);
                debug_assert!(!shared.inlineable);
            }

            let Some(feedback) = feedback else { continue };
            if !shared.inlineable {
                continue;
            }
            let subject =
                CompilationSubject::for_closure(FunctionBlueprint::new(shared_id, feedback), object);
            let result =
                self.run_child_serializer(subject, new_target.clone(), &arguments, with_spread);
            self.env.accumulator_hints_mut().union_from(&result);
        }

        let blueprints: Vec<FunctionBlueprint> = callee.blueprints().iter().copied().collect();
        for blueprint in blueprints {
            let shared = heap.shared(blueprint.shared);

            if shared.is_api_function() {
                self.process_api_call(blueprint.shared, &arguments);
                debug_assert!(!shared.inlineable);
            } else if shared.has_builtin_id() {
                self.process_builtin_call(blueprint.shared, &arguments);
                debug_assert!(!shared.inlineable);
            }

            if !shared.inlineable {
                continue;
            }
            let subject = CompilationSubject::for_blueprint(blueprint);
            let result =
                self.run_child_serializer(subject, new_target.clone(), &arguments, with_spread);
            self.env.accumulator_hints_mut().union_from(&result);
        }
    }

    fn run_child_serializer(
        &mut self,
        subject: CompilationSubject,
        new_target: Option<Hints>,
        arguments: &HintsVec,
        with_spread: bool,
    ) -> Hints {
        if with_spread {
            assert!(!arguments.is_empty(), "spread call without arguments");
            // Drop the spread element, whose expansion is unknown, and
            // pretend the callee receives its full parameter list with
            // nothing known about the tail.
            let mut padded: HintsVec = arguments[..arguments.len() - 1].iter().cloned().collect();
            let param_count = self
                .broker
                .heap()
                .shared(subject.blueprint.shared)
                .bytecode
                .as_ref()
                .expect("inlineable function without bytecode")
                .parameter_count as usize;
            padded.resize(param_count, Hints::new());
            return self.run_child_serializer(subject, new_target, &padded, false);
        }

        let flags = self.flags.without_osr();
        let mut child =
            HintSerializer::inlined(&mut *self.broker, subject, new_target, arguments, flags);
        child.run()
    }

    // ---------------------------------------------------------------
    // API and builtin calls
    // ---------------------------------------------------------------

    fn process_api_call(&mut self, shared: SharedId, arguments: &[Hints]) {
        let heap = self.broker.heap();
        let template_id = heap
            .shared(shared)
            .function_template
            .expect("api function without template");
        self.broker.record_function_template(template_id);

        let template = heap.template(template_id);
        if !template.has_call_code {
            return;
        }
        if template.accept_any_receiver && template.signature.is_none() {
            return;
        }

        assert!(!arguments.is_empty(), "api call without a receiver");
        let receiver_hints = &arguments[0];
        for constant in receiver_hints.constants().iter().copied() {
            let shape = match constant {
                // An undefined receiver stands for the global proxy.
                Constant::Undefined => heap.object(heap.native_context().global_proxy).shape,
                Constant::Heap(object) => heap.object(object).shape,
                _ => continue,
            };
            self.process_receiver_shape_for_api_call(template_id, shape);
        }
        for shape in receiver_hints.shapes().iter().copied() {
            self.process_receiver_shape_for_api_call(template_id, shape);
        }
    }

    fn process_receiver_shape_for_api_call(&mut self, template: TemplateId, shape: ShapeId) {
        if self.broker.heap().shape(shape).needs_access_check {
            return;
        }
        self.broker.lookup_holder_of_expected_type(template, shape);
    }

    fn process_builtin_call(&mut self, shared: SharedId, arguments: &[Hints]) {
        let heap = self.broker.heap();
        let builtin = heap
            .shared(shared)
            .builtin
            .expect("builtin call without builtin id");
        match builtin {
            Builtin::PromiseConstructor => {
                trace!("materializing for the promise constructor");
                self.broker.record_scope_info();
                self.broker.record_promise_default_codes();
            }
            Builtin::PromisePrototypeCatch | Builtin::PromisePrototypeFinally => {
                self.broker.record_scope_info();
                assert!(!arguments.is_empty());
                self.process_shape_hints_for_promises(&arguments[0]);
            }
            Builtin::PromisePrototypeThen => {
                assert!(!arguments.is_empty());
                self.process_shape_hints_for_promises(&arguments[0]);
            }
            Builtin::Other => {}
        }
    }

    fn process_shape_hints_for_promises(&mut self, receiver_hints: &Hints) {
        let heap = self.broker.heap();
        // The call reductions read the prototype off each promise shape.
        for constant in receiver_hints.constants().iter().copied() {
            let Constant::Heap(object) = constant else {
                continue;
            };
            if heap.is_promise(object) {
                self.broker.record_shape_prototype(heap.object(object).shape);
            }
        }
        for shape in receiver_hints.shapes().iter().copied() {
            if heap.shape(shape).is_promise_shape {
                self.broker.record_shape_prototype(shape);
            }
        }
    }

    // ---------------------------------------------------------------
    // Feedback bailout
    // ---------------------------------------------------------------

    fn bailout_on_uninitialized(&mut self, slot: FeedbackSlot) -> bool {
        assert!(!self.env.is_dead());
        if !self.flags.bailout_on_uninitialized {
            return false;
        }
        if self.flags.osr {
            // The replacement entry point may sit inside code that never
            // ran; it must not be skipped.
            return false;
        }
        if slot.is_invalid() {
            return false;
        }
        let source = FeedbackSource::new(self.env.function().feedback, slot);
        if !self.broker.nexus(source).is_uninitialized() {
            return false;
        }
        if self.broker.has_feedback(source) {
            debug_assert!(matches!(
                self.broker.get_feedback(source),
                Some(ProcessedFeedback::Insufficient)
            ));
        } else {
            self.broker
                .set_feedback(source, ProcessedFeedback::Insufficient);
        }
        trace!("uninitialized feedback, killing environment");
        self.env.kill();
        true
    }

    // ---------------------------------------------------------------
    // Jump joins
    // ---------------------------------------------------------------

    fn process_jump(&mut self, it: &BytecodeIterator) {
        let target = it.jump_target_offset();
        // Only forward edges contribute: the walk is a single forward
        // pass, so a backward target has already been visited.
        if it.current_offset() < target {
            self.contribute_to_jump_target_environment(target);
        }
    }

    fn contribute_to_jump_target_environment(&mut self, target: usize) {
        match self.jump_target_envs.get_mut(&target) {
            Some(stored) => stored.merge(&self.env),
            None => {
                self.jump_target_envs.insert(target, self.env.clone());
            }
        }
    }

    fn incorporate_jump_target_environment(&mut self, offset: usize) {
        if let Some(stored) = self.jump_target_envs.remove(&offset) {
            self.env.merge(&stored);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::HandlerRange;

    #[test]
    fn test_handler_targets_cursor() {
        let mut chunk = BytecodeChunk::new(1, 0);
        chunk.handler_table = vec![
            HandlerRange {
                start: 0,
                end: 4,
                handler: 8,
            },
            HandlerRange {
                start: 10,
                end: 12,
                handler: 4,
            },
        ];
        let mut targets = ExceptionHandlerTargets::new(&chunk);
        assert!(!targets.is_handler_start(0));
        assert!(targets.is_handler_start(4));
        assert!(!targets.is_handler_start(6));
        assert!(targets.is_handler_start(8));
        assert!(!targets.is_handler_start(20));
    }

    #[test]
    fn test_flags_without_osr() {
        let flags = SerializerFlags {
            bailout_on_uninitialized: true,
            collect_source_positions: true,
            osr: true,
        };
        let child = flags.without_osr();
        assert!(child.bailout_on_uninitialized);
        assert!(child.collect_source_positions);
        assert!(!child.osr);
    }
}
