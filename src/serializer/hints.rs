//! Speculative value approximations
//!
//! A hint set describes what a slot *might* hold at a program point: the
//! union of pinned constants, receiver shapes and blueprints of closures
//! that have not been materialized yet. Hint sets only ever grow along a
//! walk; emptiness means "nothing known", never "nothing possible".

use crate::heap::{Constant, ObjectId, ShapeId, SharedId, VectorId};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::fmt;

/// Argument hint sets packaged at a call site.
pub type HintsVec = SmallVec<[Hints; 8]>;

/// Identity of a closure-to-be: shared info plus the feedback vector the
/// closure will bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionBlueprint {
    /// The function's code and metadata
    pub shared: SharedId,
    /// The profile data the closure binds
    pub feedback: VectorId,
}

impl FunctionBlueprint {
    /// A blueprint for `(shared, feedback)`.
    pub fn new(shared: SharedId, feedback: VectorId) -> Self {
        Self { shared, feedback }
    }
}

/// What an analysis runs on: a blueprint, plus the concrete closure when
/// one is known (constant propagation of the closure is then preferred).
#[derive(Debug, Clone, Copy)]
pub struct CompilationSubject {
    /// The blueprint under analysis
    pub blueprint: FunctionBlueprint,
    /// The concrete closure, if known
    pub closure: Option<ObjectId>,
}

impl CompilationSubject {
    /// A subject with a known closure.
    pub fn for_closure(blueprint: FunctionBlueprint, closure: ObjectId) -> Self {
        Self {
            blueprint,
            closure: Some(closure),
        }
    }

    /// A subject known only by blueprint.
    pub fn for_blueprint(blueprint: FunctionBlueprint) -> Self {
        Self {
            blueprint,
            closure: None,
        }
    }
}

/// A set of hints: constants, shapes and function blueprints.
///
/// The three kinds are kept in separate de-duplicating sets so transfer
/// functions can iterate exactly the kind they care about. No ordering is
/// promised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hints {
    constants: FxHashSet<Constant>,
    shapes: FxHashSet<ShapeId>,
    blueprints: FxHashSet<FunctionBlueprint>,
}

impl Hints {
    /// An empty hint set.
    pub fn new() -> Self {
        Self::default()
    }

    /// A hint set holding a single constant.
    pub fn constant(value: Constant) -> Self {
        let mut hints = Self::new();
        hints.add_constant(value);
        hints
    }

    /// The constant hints.
    pub fn constants(&self) -> &FxHashSet<Constant> {
        &self.constants
    }

    /// The shape hints.
    pub fn shapes(&self) -> &FxHashSet<ShapeId> {
        &self.shapes
    }

    /// The blueprint hints.
    pub fn blueprints(&self) -> &FxHashSet<FunctionBlueprint> {
        &self.blueprints
    }

    /// Add a constant hint.
    pub fn add_constant(&mut self, value: Constant) {
        self.constants.insert(value);
    }

    /// Add a shape hint.
    pub fn add_shape(&mut self, shape: ShapeId) {
        self.shapes.insert(shape);
    }

    /// Add a blueprint hint.
    pub fn add_blueprint(&mut self, blueprint: FunctionBlueprint) {
        self.blueprints.insert(blueprint);
    }

    /// Union another hint set into this one.
    pub fn union_from(&mut self, other: &Hints) {
        self.constants.extend(other.constants.iter().copied());
        self.shapes.extend(other.shapes.iter().copied());
        self.blueprints.extend(other.blueprints.iter().copied());
    }

    /// Remove every hint.
    pub fn clear(&mut self) {
        self.constants.clear();
        self.shapes.clear();
        self.blueprints.clear();
        debug_assert!(self.is_empty());
    }

    /// Is anything known?
    pub fn is_empty(&self) -> bool {
        self.constants.is_empty() && self.shapes.is_empty() && self.blueprints.is_empty()
    }

    /// Does this set contain everything `other` does? Used by debug
    /// assertions only.
    pub fn includes(&self, other: &Hints) -> bool {
        self.constants.is_superset(&other.constants)
            && self.shapes.is_superset(&other.shapes)
            && self.blueprints.is_superset(&other.blueprints)
    }
}

impl fmt::Display for Hints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for constant in &self.constants {
            writeln!(f, "  constant {}", constant)?;
        }
        for shape in &self.shapes {
            writeln!(f, "  shape #{}", shape.0)?;
        }
        for blueprint in &self.blueprints {
            writeln!(
                f,
                "  blueprint (shared#{}, vector#{})",
                blueprint.shared.0, blueprint.feedback.0
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Hints {
        let mut hints = Hints::new();
        hints.add_constant(Constant::Smi(1));
        hints.add_shape(ShapeId(2));
        hints.add_blueprint(FunctionBlueprint::new(SharedId(0), VectorId(0)));
        hints
    }

    #[test]
    fn test_duplicates_are_absorbed() {
        let mut hints = Hints::new();
        hints.add_constant(Constant::Smi(1));
        hints.add_constant(Constant::Smi(1));
        assert_eq!(hints.constants().len(), 1);
    }

    #[test]
    fn test_union_is_idempotent() {
        let mut a = sample();
        let snapshot = a.clone();
        a.union_from(&snapshot);
        assert_eq!(a, snapshot);
    }

    #[test]
    fn test_union_is_commutative() {
        let mut left = sample();
        let mut extra = Hints::new();
        extra.add_constant(Constant::Null);
        extra.add_shape(ShapeId(9));

        let mut right = extra.clone();
        left.union_from(&extra);
        right.union_from(&sample());
        assert_eq!(left, right);
    }

    #[test]
    fn test_union_is_associative() {
        let a = sample();
        let b = Hints::constant(Constant::Null);
        let c = Hints::constant(Constant::Smi(5));

        let mut ab = a.clone();
        ab.union_from(&b);
        let mut ab_c = ab.clone();
        ab_c.union_from(&c);

        let mut bc = b.clone();
        bc.union_from(&c);
        let mut a_bc = a.clone();
        a_bc.union_from(&bc);

        assert_eq!(ab_c, a_bc);
    }

    #[test]
    fn test_inclusion() {
        let big = sample();
        let mut small = Hints::new();
        small.add_constant(Constant::Smi(1));
        assert!(big.includes(&small));
        assert!(!small.includes(&big));
        assert!(big.includes(&big));
    }

    #[test]
    fn test_clear() {
        let mut hints = sample();
        assert!(!hints.is_empty());
        hints.clear();
        assert!(hints.is_empty());
    }
}
