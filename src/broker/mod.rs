//! The heap broker: the compilation-side store of runtime metadata
//!
//! The optimizer runs on a thread that must not touch the runtime heap, so
//! every piece of metadata it might need is copied through the broker
//! while the speculation engine walks bytecode. The broker also memoizes
//! processed feedback per `(vector, slot)` source and remembers which
//! `(shared, vector)` pairs have already been analyzed.

mod access_info;

pub use access_info::{AccessInfoFactory, AccessMode, PropertyAccessInfo};

use crate::heap::feedback::{FeedbackNexus, FeedbackSlot};
use crate::heap::{Constant, Heap, NameId, ObjectId, ShapeId, SharedId, TemplateId, VectorId};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

/// Cache key for processed feedback: a slot of a concrete vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedbackSource {
    /// The feedback vector
    pub vector: VectorId,
    /// The slot within it
    pub slot: FeedbackSlot,
}

impl FeedbackSource {
    /// A source for `slot` of `vector`.
    pub fn new(vector: VectorId, slot: FeedbackSlot) -> Self {
        Self { vector, slot }
    }
}

/// Feedback about a global access site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalAccessFeedback {
    /// The property cell backing the global, if any
    pub cell: Option<ObjectId>,
    /// The cell's value, when it can serve as a constant hint
    pub constant: Option<Constant>,
}

impl GlobalAccessFeedback {
    /// The value to feed into constant hints, if any.
    pub fn constant_hint(&self) -> Option<Constant> {
        self.constant
    }
}

/// Feedback about a named property access site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedAccessFeedback {
    /// The property name
    pub name: NameId,
    /// One access plan per relevant receiver shape
    pub access_infos: Vec<PropertyAccessInfo>,
}

/// Feedback about an element access site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementAccessFeedback {
    /// The relevant receiver shapes
    pub shapes: Vec<ShapeId>,
}

/// The memoized result of processing one feedback source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessedFeedback {
    /// The site has not produced usable feedback
    Insufficient,
    /// The site saw too many shapes to specialize
    Megamorphic,
    /// A global access site
    Global(GlobalAccessFeedback),
    /// A named property access site
    NamedAccess(NamedAccessFeedback),
    /// An element access site
    ElementAccess(ElementAccessFeedback),
}

/// Everything materialized off the runtime heap during an analysis.
///
/// Each collection marks one category of metadata the optimizer may later
/// read without heap access.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    /// Closures copied wholesale
    pub functions: FxHashSet<ObjectId>,
    /// Shapes whose prototype link was copied
    pub shape_prototypes: FxHashSet<ShapeId>,
    /// Global property cells, by name
    pub property_cells: FxHashMap<NameId, ObjectId>,
    /// The native context's scope info was copied
    pub scope_info: bool,
    /// Default promise-resolve code was copied
    pub promise_default_resolve: bool,
    /// Default promise-reject code was copied
    pub promise_default_reject: bool,
    /// Function templates copied for API calls
    pub function_templates: FxHashSet<TemplateId>,
    /// Expected-type holder lookups performed for API calls
    pub holder_lookups: FxHashSet<(TemplateId, ShapeId)>,
    /// Typed arrays whose backing store was copied
    pub typed_arrays: FxHashSet<ObjectId>,
    /// Own constant elements read off array-likes
    pub own_elements: FxHashSet<(ObjectId, u32)>,
    /// Copy-on-write element probes on arrays
    pub cow_element_probes: FxHashSet<(ObjectId, u32)>,
    /// Shapes prepared for element loads
    pub element_loads: FxHashSet<ShapeId>,
    /// Shapes prepared for element stores
    pub element_stores: FxHashSet<ShapeId>,
    /// Feedback vectors whose slots were copied
    pub vector_slots: FxHashSet<VectorId>,
    /// Shared infos whose source positions were collected
    pub source_positions: FxHashSet<SharedId>,
}

/// The broker: heap access plus the caches of one compilation.
pub struct HeapBroker<'h> {
    heap: &'h Heap,
    feedback: FxHashMap<FeedbackSource, ProcessedFeedback>,
    serialized_for_compilation: FxHashSet<(SharedId, VectorId)>,
    /// The materialized-metadata store
    pub snapshots: SnapshotStore,
}

impl<'h> HeapBroker<'h> {
    /// A broker over `heap` with empty caches.
    pub fn new(heap: &'h Heap) -> Self {
        Self {
            heap,
            feedback: FxHashMap::default(),
            serialized_for_compilation: FxHashSet::default(),
            snapshots: SnapshotStore::default(),
        }
    }

    /// The heap model.
    pub fn heap(&self) -> &'h Heap {
        self.heap
    }

    // ---------------------------------------------------------------
    // Feedback cache
    // ---------------------------------------------------------------

    /// Has this source been processed already?
    pub fn has_feedback(&self, source: FeedbackSource) -> bool {
        self.feedback.contains_key(&source)
    }

    /// The processed feedback for a source, if cached.
    pub fn get_feedback(&self, source: FeedbackSource) -> Option<&ProcessedFeedback> {
        self.feedback.get(&source)
    }

    /// Cache processed feedback for a source. The first write wins.
    pub fn set_feedback(&mut self, source: FeedbackSource, feedback: ProcessedFeedback) {
        self.feedback.entry(source).or_insert(feedback);
    }

    /// A nexus over a source's slot.
    pub fn nexus(&self, source: FeedbackSource) -> FeedbackNexus<'h> {
        FeedbackNexus::new(self.heap.vector(source.vector), source.slot)
    }

    // ---------------------------------------------------------------
    // Analyzed-once marks
    // ---------------------------------------------------------------

    /// Has this `(shared, vector)` pair been analyzed this compilation?
    pub fn is_serialized_for_compilation(&self, shared: SharedId, vector: VectorId) -> bool {
        self.serialized_for_compilation.contains(&(shared, vector))
    }

    /// Mark a `(shared, vector)` pair analyzed.
    pub fn set_serialized_for_compilation(&mut self, shared: SharedId, vector: VectorId) {
        self.serialized_for_compilation.insert((shared, vector));
    }

    // ---------------------------------------------------------------
    // Shape filtering
    // ---------------------------------------------------------------

    /// Live-update each shape and drop the ones whose prototype was
    /// abandoned. Deprecated shapes follow their update chain.
    pub fn relevant_receiver_shapes<I>(&self, shapes: I) -> Vec<ShapeId>
    where
        I: IntoIterator<Item = ShapeId>,
    {
        let mut result = Vec::new();
        for mut id in shapes {
            while let Some(updated) = self.heap.shape(id).updated_to {
                id = updated;
            }
            let shape = self.heap.shape(id);
            // A shape that could not be live-updated, or whose prototype
            // was abandoned, is useless to the optimizer.
            if shape.is_deprecated || shape.is_abandoned_prototype {
                continue;
            }
            result.push(id);
        }
        result
    }

    // ---------------------------------------------------------------
    // Global access derivation
    // ---------------------------------------------------------------

    /// Derive feedback for a global access site, snapshotting the backing
    /// property cell.
    pub fn derive_global_access_feedback(&mut self, source: FeedbackSource) -> GlobalAccessFeedback {
        let cell = self.nexus(source).global_cell();
        let constant = match cell {
            Some(cell) => {
                let name = self
                    .heap
                    .global_cell_name(cell)
                    .expect("feedback cell is not a registered global cell");
                self.record_property_cell(name, cell);
                self.heap.cell_value(cell)
            }
            None => None,
        };
        GlobalAccessFeedback { cell, constant }
    }

    // ---------------------------------------------------------------
    // Snapshot recording
    // ---------------------------------------------------------------

    /// Copy a closure into the side store.
    pub fn record_function(&mut self, function: ObjectId) {
        if self.snapshots.functions.insert(function) {
            trace!(function = function.0, "snapshot function");
        }
    }

    /// Copy a shape's prototype link into the side store.
    pub fn record_shape_prototype(&mut self, shape: ShapeId) {
        if self.snapshots.shape_prototypes.insert(shape) {
            trace!(shape = shape.0, "snapshot shape prototype");
        }
    }

    /// Copy a global property cell into the side store.
    pub fn record_property_cell(&mut self, name: NameId, cell: ObjectId) {
        if self
            .snapshots
            .property_cells
            .insert(name, cell)
            .is_none()
        {
            trace!(name = name.0, cell = cell.0, "snapshot property cell");
        }
    }

    /// Copy the native context's scope info.
    pub fn record_scope_info(&mut self) {
        self.snapshots.scope_info = true;
    }

    /// Copy the default promise-capability codes.
    pub fn record_promise_default_codes(&mut self) {
        self.snapshots.promise_default_resolve = true;
        self.snapshots.promise_default_reject = true;
    }

    /// Copy a function template.
    pub fn record_function_template(&mut self, template: TemplateId) {
        if self.snapshots.function_templates.insert(template) {
            trace!(template = template.0, "snapshot function template");
        }
    }

    /// Look up (and remember) the expected-type holder for an API call
    /// receiver shape.
    pub fn lookup_holder_of_expected_type(&mut self, template: TemplateId, receiver: ShapeId) {
        if self.snapshots.holder_lookups.insert((template, receiver)) {
            trace!(
                template = template.0,
                shape = receiver.0,
                "holder lookup for api call"
            );
        }
    }

    /// Copy a typed array's backing-store metadata.
    pub fn record_typed_array(&mut self, object: ObjectId) {
        self.snapshots.typed_arrays.insert(object);
    }

    /// Read an own constant element off the heap, remembering the probe.
    pub fn get_own_constant_element(&mut self, object: ObjectId, index: u32) -> Option<Constant> {
        self.snapshots.own_elements.insert((object, index));
        self.heap.own_constant_element(object, index)
    }

    /// Probe a copy-on-write element of an array, remembering the probe.
    pub fn get_own_cow_element(&mut self, object: ObjectId, index: u32) -> Option<Constant> {
        if !self.heap.has_cow_elements(object) {
            return None;
        }
        self.snapshots.cow_element_probes.insert((object, index));
        self.heap.own_constant_element(object, index)
    }

    /// Prepare a shape for element loads.
    pub fn record_element_load(&mut self, shape: ShapeId) {
        self.snapshots.element_loads.insert(shape);
    }

    /// Prepare a shape for element stores.
    pub fn record_element_store(&mut self, shape: ShapeId) {
        self.snapshots.element_stores.insert(shape);
    }

    /// Copy all slots of a feedback vector.
    pub fn record_vector_slots(&mut self, vector: VectorId) {
        self.snapshots.vector_slots.insert(vector);
    }

    /// Collect source positions for a shared info.
    pub fn record_source_positions(&mut self, shared: SharedId) {
        self.snapshots.source_positions.insert(shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::feedback::{FeedbackSlotData, FeedbackVector};
    use crate::heap::Shape;

    #[test]
    fn test_feedback_cache_first_write_wins() {
        let heap = Heap::new();
        let mut broker = HeapBroker::new(&heap);
        let source = FeedbackSource::new(VectorId(0), FeedbackSlot::new(0));

        assert!(!broker.has_feedback(source));
        broker.set_feedback(source, ProcessedFeedback::Insufficient);
        broker.set_feedback(source, ProcessedFeedback::Megamorphic);
        assert_eq!(
            broker.get_feedback(source),
            Some(&ProcessedFeedback::Insufficient)
        );
    }

    #[test]
    fn test_serialized_for_compilation_marks() {
        let heap = Heap::new();
        let mut broker = HeapBroker::new(&heap);
        assert!(!broker.is_serialized_for_compilation(SharedId(0), VectorId(0)));
        broker.set_serialized_for_compilation(SharedId(0), VectorId(0));
        assert!(broker.is_serialized_for_compilation(SharedId(0), VectorId(0)));
        assert!(!broker.is_serialized_for_compilation(SharedId(0), VectorId(1)));
    }

    #[test]
    fn test_relevant_receiver_shapes_follow_updates() {
        let mut heap = Heap::new();
        let fresh = heap.add_shape(Shape::default());
        let deprecated = heap.add_shape(Shape {
            is_deprecated: true,
            updated_to: Some(fresh),
            ..Shape::default()
        });
        let abandoned = heap.add_shape(Shape {
            is_abandoned_prototype: true,
            ..Shape::default()
        });

        let broker = HeapBroker::new(&heap);
        let shapes = broker.relevant_receiver_shapes([deprecated, abandoned, fresh]);
        assert_eq!(shapes, vec![fresh, fresh]);
    }

    #[test]
    fn test_global_access_derivation_snapshots_cell() {
        let mut heap = Heap::new();
        let name = heap.names.intern("answer");
        let cell = heap.add_global_cell(name, Constant::Smi(42));
        let mut vector = FeedbackVector::default();
        let slot = vector.add_slot(FeedbackSlotData::for_global_cell(cell));
        let vector = heap.add_vector(vector);

        let mut broker = HeapBroker::new(&heap);
        let feedback = broker.derive_global_access_feedback(FeedbackSource::new(vector, slot));
        assert_eq!(feedback.constant_hint(), Some(Constant::Smi(42)));
        assert_eq!(broker.snapshots.property_cells.get(&name), Some(&cell));
    }

    #[test]
    fn test_cow_element_probe() {
        let mut heap = Heap::new();
        let shape = heap.add_shape(Shape::default());
        let array = heap.add_object(crate::heap::HeapObject {
            shape,
            kind: crate::heap::HeapObjectKind::Array {
                elements: vec![Constant::Smi(1)],
                cow: true,
            },
        });

        let mut broker = HeapBroker::new(&heap);
        assert_eq!(broker.get_own_cow_element(array, 0), Some(Constant::Smi(1)));
        assert!(broker.snapshots.cow_element_probes.contains(&(array, 0)));
    }
}
