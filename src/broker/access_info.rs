//! Property access planning
//!
//! Translates a (shape, name, mode) triple into the access plan the
//! optimizer will specialize on: an own data field, a constant found on a
//! prototype holder, or nothing.

use crate::heap::{Heap, NameId, ObjectId, ShapeId};

/// How a property access site uses the property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Read
    Load,
    /// Write
    Store,
    /// Write while building a literal
    StoreInLiteral,
    /// Presence test
    Has,
}

/// The plan computed for one receiver shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyAccessInfo {
    /// The shape has no such property anywhere on its chain
    NotFound,
    /// An own data field at a fixed offset
    DataField {
        /// Field offset within the object
        offset: u32,
    },
    /// A property found on a prototype holder
    DataConstant {
        /// The prototype object holding the property
        holder: ObjectId,
        /// Field offset within the holder
        offset: u32,
    },
}

/// Computes access plans against the heap model.
pub struct AccessInfoFactory<'h> {
    heap: &'h Heap,
}

impl<'h> AccessInfoFactory<'h> {
    /// A factory reading from `heap`.
    pub fn new(heap: &'h Heap) -> Self {
        Self { heap }
    }

    /// The access plan for `name` on a receiver of `shape`.
    ///
    /// Stores never walk the prototype chain; a missing own property is a
    /// transition the engine does not plan for.
    pub fn compute_property_access_info(
        &self,
        shape: ShapeId,
        name: NameId,
        mode: AccessMode,
    ) -> PropertyAccessInfo {
        let own = self.heap.shape(shape);
        if let Some(offset) = own.lookup_descriptor(name) {
            return PropertyAccessInfo::DataField { offset };
        }

        if matches!(mode, AccessMode::Store | AccessMode::StoreInLiteral) {
            return PropertyAccessInfo::NotFound;
        }

        let mut prototype = own.prototype;
        while let Some(holder) = prototype {
            let holder_shape = self.heap.shape(self.heap.object(holder).shape);
            if let Some(offset) = holder_shape.lookup_descriptor(name) {
                return PropertyAccessInfo::DataConstant { holder, offset };
            }
            prototype = holder_shape.prototype;
        }

        PropertyAccessInfo::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{HeapObject, HeapObjectKind, Shape};

    #[test]
    fn test_own_data_field() {
        let mut heap = Heap::new();
        let name = heap.names.intern("x");
        let shape = heap.add_shape(Shape {
            descriptors: vec![(name, 4)],
            ..Shape::default()
        });

        let factory = AccessInfoFactory::new(&heap);
        assert_eq!(
            factory.compute_property_access_info(shape, name, AccessMode::Load),
            PropertyAccessInfo::DataField { offset: 4 }
        );
    }

    #[test]
    fn test_prototype_holder() {
        let mut heap = Heap::new();
        let name = heap.names.intern("m");
        let proto_shape = heap.add_shape(Shape {
            descriptors: vec![(name, 0)],
            ..Shape::default()
        });
        let proto = heap.add_object(HeapObject {
            shape: proto_shape,
            kind: HeapObjectKind::Ordinary,
        });
        let shape = heap.add_shape(Shape {
            prototype: Some(proto),
            ..Shape::default()
        });

        let factory = AccessInfoFactory::new(&heap);
        assert_eq!(
            factory.compute_property_access_info(shape, name, AccessMode::Load),
            PropertyAccessInfo::DataConstant {
                holder: proto,
                offset: 0
            }
        );
        // Stores do not reach through the chain.
        assert_eq!(
            factory.compute_property_access_info(shape, name, AccessMode::Store),
            PropertyAccessInfo::NotFound
        );
    }

    #[test]
    fn test_not_found() {
        let mut heap = Heap::new();
        let name = heap.names.intern("missing");
        let shape = heap.add_shape(Shape::default());

        let factory = AccessInfoFactory::new(&heap);
        assert_eq!(
            factory.compute_property_access_info(shape, name, AccessMode::Has),
            PropertyAccessInfo::NotFound
        );
    }
}
