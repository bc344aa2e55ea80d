//! Runtime profile data attached to functions
//!
//! A feedback vector records what the interpreter observed at each
//! feedback slot: inline-cache states, receiver shapes, property names,
//! call targets and global property cells. The engine reads this data
//! through a [`FeedbackNexus`], a decoded view of one slot.

use super::{NameId, ObjectId, ShapeId, VectorId};

/// Index of a feedback slot within a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedbackSlot(u16);

impl FeedbackSlot {
    /// The invalid slot: operations without profile data carry it.
    pub const INVALID: FeedbackSlot = FeedbackSlot(u16::MAX);

    /// A slot for the given index.
    pub fn new(index: u16) -> Self {
        FeedbackSlot(index)
    }

    /// Is this the invalid slot?
    pub fn is_invalid(self) -> bool {
        self == Self::INVALID
    }

    /// The slot's index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Inline-cache state of a feedback slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcState {
    /// Nothing observed yet
    Uninitialized,
    /// One shape observed
    Monomorphic,
    /// A few shapes observed
    Polymorphic,
    /// Too many shapes observed to specialize
    Megamorphic,
}

/// What kind of key a property-access slot observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Integer-indexed element access
    Element,
    /// Named property access
    Named,
}

/// The recorded contents of one feedback slot.
#[derive(Debug, Clone)]
pub struct FeedbackSlotData {
    /// Inline-cache state
    pub state: IcState,
    /// Receiver shapes observed at the site
    pub shapes: Vec<ShapeId>,
    /// Property name observed at a named-access site
    pub name: Option<NameId>,
    /// Key kind observed at a keyed site
    pub key_type: KeyType,
    /// Callable observed at a call/construct site
    pub target: Option<ObjectId>,
    /// Property cell backing a global-access site
    pub cell: Option<ObjectId>,
}

impl FeedbackSlotData {
    /// A slot that has observed nothing.
    pub fn uninitialized() -> Self {
        Self {
            state: IcState::Uninitialized,
            shapes: Vec::new(),
            name: None,
            key_type: KeyType::Named,
            target: None,
            cell: None,
        }
    }

    /// A megamorphic slot with no extractable shapes.
    pub fn megamorphic() -> Self {
        Self {
            state: IcState::Megamorphic,
            ..Self::uninitialized()
        }
    }

    /// A property-access slot that observed the given shapes.
    pub fn for_shapes(shapes: Vec<ShapeId>, name: Option<NameId>) -> Self {
        let state = if shapes.len() == 1 {
            IcState::Monomorphic
        } else {
            IcState::Polymorphic
        };
        Self {
            state,
            shapes,
            name,
            ..Self::uninitialized()
        }
    }

    /// An element-access slot that observed the given shapes.
    pub fn for_elements(shapes: Vec<ShapeId>) -> Self {
        Self {
            key_type: KeyType::Element,
            ..Self::for_shapes(shapes, None)
        }
    }

    /// A call/construct slot that observed a callable target.
    pub fn for_call_target(target: ObjectId) -> Self {
        Self {
            state: IcState::Monomorphic,
            target: Some(target),
            ..Self::uninitialized()
        }
    }

    /// A global-access slot backed by a property cell.
    pub fn for_global_cell(cell: ObjectId) -> Self {
        Self {
            state: IcState::Monomorphic,
            cell: Some(cell),
            ..Self::uninitialized()
        }
    }
}

/// A closure feedback cell: it holds a vector once the closure has run.
#[derive(Debug, Clone, Default)]
pub struct FeedbackCell {
    /// The vector the cell holds, if the closure ever executed
    pub vector: Option<VectorId>,
}

/// A function's profile data: feedback slots plus closure feedback cells.
#[derive(Debug, Clone, Default)]
pub struct FeedbackVector {
    /// Slot contents, indexed by [`FeedbackSlot`]
    pub slots: Vec<FeedbackSlotData>,
    /// Cells consulted when the function creates closures
    pub closure_cells: Vec<FeedbackCell>,
}

impl FeedbackVector {
    /// Append a slot, returning its index.
    pub fn add_slot(&mut self, data: FeedbackSlotData) -> FeedbackSlot {
        let slot = FeedbackSlot::new(self.slots.len() as u16);
        self.slots.push(data);
        slot
    }

    /// Append a closure feedback cell, returning its index.
    pub fn add_closure_cell(&mut self, cell: FeedbackCell) -> usize {
        self.closure_cells.push(cell);
        self.closure_cells.len() - 1
    }
}

/// Decoded view of one feedback slot.
///
/// A slot the vector never recorded reads as uninitialized.
pub struct FeedbackNexus<'h> {
    vector: &'h FeedbackVector,
    slot: FeedbackSlot,
}

impl<'h> FeedbackNexus<'h> {
    /// A nexus over `slot` of `vector`. The slot must be valid.
    pub fn new(vector: &'h FeedbackVector, slot: FeedbackSlot) -> Self {
        assert!(!slot.is_invalid(), "nexus over the invalid slot");
        Self { vector, slot }
    }

    fn data(&self) -> Option<&'h FeedbackSlotData> {
        self.vector.slots.get(self.slot.index())
    }

    /// The slot's inline-cache state.
    pub fn ic_state(&self) -> IcState {
        self.data().map_or(IcState::Uninitialized, |d| d.state)
    }

    /// Has the slot observed nothing?
    pub fn is_uninitialized(&self) -> bool {
        self.ic_state() == IcState::Uninitialized
    }

    /// The receiver shapes the slot observed.
    pub fn extract_shapes(&self) -> &'h [ShapeId] {
        self.data().map_or(&[], |d| d.shapes.as_slice())
    }

    /// The key kind the slot observed.
    pub fn key_type(&self) -> KeyType {
        self.data().map_or(KeyType::Named, |d| d.key_type)
    }

    /// The callable the slot observed, if any.
    pub fn heap_object_feedback(&self) -> Option<ObjectId> {
        self.data().and_then(|d| d.target)
    }

    /// The property name the slot observed, if any.
    pub fn name_feedback(&self) -> Option<NameId> {
        self.data().and_then(|d| d.name)
    }

    /// The property cell backing the slot, if any.
    pub fn global_cell(&self) -> Option<ObjectId> {
        self.data().and_then(|d| d.cell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_slot() {
        assert!(FeedbackSlot::INVALID.is_invalid());
        assert!(!FeedbackSlot::new(0).is_invalid());
    }

    #[test]
    fn test_nexus_reads_slot_data() {
        let mut vector = FeedbackVector::default();
        let slot = vector.add_slot(FeedbackSlotData::for_shapes(
            vec![ShapeId(1), ShapeId(2)],
            Some(NameId(0)),
        ));

        let nexus = FeedbackNexus::new(&vector, slot);
        assert_eq!(nexus.ic_state(), IcState::Polymorphic);
        assert_eq!(nexus.extract_shapes(), &[ShapeId(1), ShapeId(2)]);
        assert_eq!(nexus.name_feedback(), Some(NameId(0)));
        assert!(!nexus.is_uninitialized());
    }

    #[test]
    fn test_missing_slot_reads_uninitialized() {
        let vector = FeedbackVector::default();
        let nexus = FeedbackNexus::new(&vector, FeedbackSlot::new(3));
        assert!(nexus.is_uninitialized());
        assert!(nexus.extract_shapes().is_empty());
    }

    #[test]
    fn test_call_target_feedback() {
        let mut vector = FeedbackVector::default();
        let slot = vector.add_slot(FeedbackSlotData::for_call_target(ObjectId(7)));
        let nexus = FeedbackNexus::new(&vector, slot);
        assert_eq!(nexus.heap_object_feedback(), Some(ObjectId(7)));
    }
}
