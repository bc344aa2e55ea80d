//! Model of the runtime heap the engine speculates about
//!
//! The speculation engine never touches a live heap; it reads an immutable
//! model of one: objects with hidden-class shapes, shared function infos
//! with their bytecode, feedback vectors, function templates and the
//! native context. Everything is addressed through typed id handles, and
//! handle identity is the only notion of object equality the engine uses.

pub mod feedback;

use crate::bytecode::BytecodeChunk;
use feedback::FeedbackVector;
use rustc_hash::FxHashMap;
use std::fmt;

/// Handle to a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

/// Handle to a shape (hidden class).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeId(pub u32);

/// Handle to a shared function info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SharedId(pub u32);

/// Handle to a feedback vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VectorId(pub u32);

/// Handle to a function template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateId(pub u32);

/// Handle to an interned property name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NameId(pub u32);

/// Names the engine compares against directly.
#[derive(Debug, Clone, Copy)]
pub struct WellKnownNames {
    /// `"prototype"`
    pub prototype: NameId,
    /// `"constructor"`
    pub constructor: NameId,
    /// `"length"`
    pub length: NameId,
    /// `"then"`
    pub then: NameId,
}

/// Interner for property names, pre-seeded with the names the engine and
/// most programs touch.
pub struct NameTable {
    names: Vec<String>,
    lookup: FxHashMap<String, NameId>,
    well_known: WellKnownNames,
}

impl NameTable {
    /// Create a table with the common property names pre-interned.
    pub fn new() -> Self {
        let mut table = Self {
            names: Vec::with_capacity(32),
            lookup: FxHashMap::default(),
            well_known: WellKnownNames {
                prototype: NameId(0),
                constructor: NameId(0),
                length: NameId(0),
                then: NameId(0),
            },
        };

        let prototype = table.intern("prototype");
        let constructor = table.intern("constructor");
        let length = table.intern("length");
        let then = table.intern("then");
        for name in [
            "name", "call", "apply", "bind", "toString", "valueOf", "catch", "finally",
        ] {
            table.intern(name);
        }
        table.well_known = WellKnownNames {
            prototype,
            constructor,
            length,
            then,
        };
        table
    }

    /// Intern a name, returning its id.
    pub fn intern(&mut self, name: &str) -> NameId {
        if let Some(&id) = self.lookup.get(name) {
            return id;
        }
        let id = NameId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.lookup.insert(name.to_string(), id);
        id
    }

    /// Resolve an id back to its string.
    pub fn get(&self, id: NameId) -> &str {
        &self.names[id.0 as usize]
    }

    /// The directly-compared names.
    pub fn well_known(&self) -> &WellKnownNames {
        &self.well_known
    }
}

impl Default for NameTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A pinned runtime value, usable as a hint constant and as a
/// constant-pool entry.
///
/// Heap values are compared by handle identity; primitives structurally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Constant {
    /// The undefined value
    Undefined,
    /// The null value
    Null,
    /// A boolean
    Bool(bool),
    /// The hole sentinel
    TheHole,
    /// A small integer
    Smi(i32),
    /// An interned string
    Str(NameId),
    /// A heap object, by handle
    Heap(ObjectId),
    /// A shared function info, by handle (constant pools only)
    Shared(SharedId),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Undefined => write!(f, "undefined"),
            Constant::Null => write!(f, "null"),
            Constant::Bool(b) => write!(f, "{}", b),
            Constant::TheHole => write!(f, "<hole>"),
            Constant::Smi(n) => write!(f, "{}", n),
            Constant::Str(id) => write!(f, "name#{}", id.0),
            Constant::Heap(id) => write!(f, "object#{}", id.0),
            Constant::Shared(id) => write!(f, "shared#{}", id.0),
        }
    }
}

/// What kind of thing a heap object is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapObjectKind {
    /// A closure: shared info plus its bound feedback vector, if any
    Function {
        /// The function's code and metadata
        shared: SharedId,
        /// The closure's profile data; absent until first execution
        feedback: Option<VectorId>,
    },
    /// An array with a known element snapshot
    Array {
        /// Element values, indexable by small integers
        elements: Vec<Constant>,
        /// Whether the backing store is copy-on-write
        cow: bool,
    },
    /// A typed array over an external buffer
    TypedArray {
        /// Element count
        length: u32,
    },
    /// A promise instance
    Promise,
    /// The global proxy object
    GlobalProxy,
    /// A global property cell holding a value
    PropertyCell {
        /// The cell's current value
        value: Constant,
    },
    /// Any other object
    Ordinary,
}

/// A heap object: its shape and its kind-specific payload.
#[derive(Debug, Clone)]
pub struct HeapObject {
    /// The object's hidden class
    pub shape: ShapeId,
    /// Kind-specific payload
    pub kind: HeapObjectKind,
}

/// A hidden class: property layout, prototype link and the flags the
/// engine consults when filtering receiver shapes.
#[derive(Debug, Clone, Default)]
pub struct Shape {
    /// Prototype object, if any
    pub prototype: Option<ObjectId>,
    /// Own data properties: name and field offset
    pub descriptors: Vec<(NameId, u32)>,
    /// Instances can be called
    pub is_callable: bool,
    /// Instances can be constructed
    pub is_constructor: bool,
    /// Shape was deprecated by a layout change
    pub is_deprecated: bool,
    /// Shape belonged to a prototype that was replaced
    pub is_abandoned_prototype: bool,
    /// Receivers of this shape require an access check
    pub needs_access_check: bool,
    /// Instances are promises
    pub is_promise_shape: bool,
    /// Live-update target for a deprecated shape
    pub updated_to: Option<ShapeId>,
}

impl Shape {
    /// Field offset of an own property, if the shape has it.
    pub fn lookup_descriptor(&self, name: NameId) -> Option<u32> {
        self.descriptors
            .iter()
            .find(|(n, _)| *n == name)
            .map(|&(_, offset)| offset)
    }
}

/// Identity of a native builtin a shared function info may be backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    /// The promise constructor
    PromiseConstructor,
    /// `Promise.prototype.then`
    PromisePrototypeThen,
    /// `Promise.prototype.catch`
    PromisePrototypeCatch,
    /// `Promise.prototype.finally`
    PromisePrototypeFinally,
    /// A builtin the engine has no special handling for
    Other,
}

/// Code and metadata of a function, independent of closure instances.
#[derive(Debug, Clone)]
pub struct SharedFunctionInfo {
    /// Source-level name, for traces
    pub name: String,
    /// The function's bytecode; absent for natives
    pub bytecode: Option<BytecodeChunk>,
    /// May the optimizer inline this function?
    pub inlineable: bool,
    /// Backing builtin, if this is a native
    pub builtin: Option<Builtin>,
    /// Template, if this is an API function
    pub function_template: Option<TemplateId>,
}

impl SharedFunctionInfo {
    /// A plain bytecode function.
    pub fn with_bytecode(name: &str, bytecode: BytecodeChunk) -> Self {
        Self {
            name: name.to_string(),
            bytecode: Some(bytecode),
            inlineable: true,
            builtin: None,
            function_template: None,
        }
    }

    /// Is this function implemented by an embedder API callback?
    pub fn is_api_function(&self) -> bool {
        self.function_template.is_some()
    }

    /// Is this function backed by a builtin?
    pub fn has_builtin_id(&self) -> bool {
        self.builtin.is_some()
    }
}

/// Template metadata of an API function.
#[derive(Debug, Clone, Default)]
pub struct FunctionTemplate {
    /// Whether the template carries a native call target
    pub has_call_code: bool,
    /// The callback accepts any receiver
    pub accept_any_receiver: bool,
    /// Receiver signature the callback requires, if any
    pub signature: Option<TemplateId>,
    /// Holder object of the expected receiver type, if known
    pub expected_holder: Option<ObjectId>,
}

/// Per-realm state the engine consults.
#[derive(Debug, Clone, Copy)]
pub struct NativeContext {
    /// The realm's global proxy object
    pub global_proxy: ObjectId,
}

/// The immutable heap model an analysis runs against.
pub struct Heap {
    objects: Vec<HeapObject>,
    shapes: Vec<Shape>,
    shared: Vec<SharedFunctionInfo>,
    vectors: Vec<FeedbackVector>,
    templates: Vec<FunctionTemplate>,
    /// Interned property names
    pub names: NameTable,
    native_context: NativeContext,
    global_cells: FxHashMap<NameId, ObjectId>,
}

impl Heap {
    /// Create a heap containing only the global proxy and its shape.
    pub fn new() -> Self {
        let mut heap = Self {
            objects: Vec::new(),
            shapes: Vec::new(),
            shared: Vec::new(),
            vectors: Vec::new(),
            templates: Vec::new(),
            names: NameTable::new(),
            native_context: NativeContext {
                global_proxy: ObjectId(0),
            },
            global_cells: FxHashMap::default(),
        };
        let proxy_shape = heap.add_shape(Shape::default());
        let proxy = heap.add_object(HeapObject {
            shape: proxy_shape,
            kind: HeapObjectKind::GlobalProxy,
        });
        heap.native_context = NativeContext {
            global_proxy: proxy,
        };
        heap
    }

    /// The realm state.
    pub fn native_context(&self) -> &NativeContext {
        &self.native_context
    }

    // ---------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------

    /// Add a shape, returning its handle.
    pub fn add_shape(&mut self, shape: Shape) -> ShapeId {
        let id = ShapeId(self.shapes.len() as u32);
        self.shapes.push(shape);
        id
    }

    /// Add an object, returning its handle.
    pub fn add_object(&mut self, object: HeapObject) -> ObjectId {
        let id = ObjectId(self.objects.len() as u32);
        self.objects.push(object);
        id
    }

    /// Add a shared function info, returning its handle.
    pub fn add_shared(&mut self, shared: SharedFunctionInfo) -> SharedId {
        let id = SharedId(self.shared.len() as u32);
        self.shared.push(shared);
        id
    }

    /// Add a feedback vector, returning its handle.
    pub fn add_vector(&mut self, vector: FeedbackVector) -> VectorId {
        let id = VectorId(self.vectors.len() as u32);
        self.vectors.push(vector);
        id
    }

    /// Add a function template, returning its handle.
    pub fn add_template(&mut self, template: FunctionTemplate) -> TemplateId {
        let id = TemplateId(self.templates.len() as u32);
        self.templates.push(template);
        id
    }

    /// Allocate a closure object with a callable shape.
    pub fn add_function(&mut self, shared: SharedId, feedback: Option<VectorId>) -> ObjectId {
        let shape = self.add_shape(Shape {
            is_callable: true,
            ..Shape::default()
        });
        self.add_object(HeapObject {
            shape,
            kind: HeapObjectKind::Function { shared, feedback },
        })
    }

    /// Install a property cell for a global, returning the cell object.
    pub fn add_global_cell(&mut self, name: NameId, value: Constant) -> ObjectId {
        let shape = self.add_shape(Shape::default());
        let cell = self.add_object(HeapObject {
            shape,
            kind: HeapObjectKind::PropertyCell { value },
        });
        self.global_cells.insert(name, cell);
        cell
    }

    // ---------------------------------------------------------------
    // Access
    // ---------------------------------------------------------------

    /// The object behind a handle.
    pub fn object(&self, id: ObjectId) -> &HeapObject {
        &self.objects[id.0 as usize]
    }

    /// The shape behind a handle.
    pub fn shape(&self, id: ShapeId) -> &Shape {
        &self.shapes[id.0 as usize]
    }

    /// The shared info behind a handle.
    pub fn shared(&self, id: SharedId) -> &SharedFunctionInfo {
        &self.shared[id.0 as usize]
    }

    /// The feedback vector behind a handle.
    pub fn vector(&self, id: VectorId) -> &FeedbackVector {
        &self.vectors[id.0 as usize]
    }

    /// The function template behind a handle.
    pub fn template(&self, id: TemplateId) -> &FunctionTemplate {
        &self.templates[id.0 as usize]
    }

    // ---------------------------------------------------------------
    // Queries used by transfer functions
    // ---------------------------------------------------------------

    /// The shape of a constant's value, if it is a heap object.
    pub fn shape_of(&self, constant: Constant) -> Option<ShapeId> {
        match constant {
            Constant::Heap(id) => Some(self.object(id).shape),
            _ => None,
        }
    }

    /// Decompose a constant that is a closure.
    pub fn as_function(&self, constant: Constant) -> Option<(ObjectId, SharedId, Option<VectorId>)> {
        match constant {
            Constant::Heap(id) => match self.object(id).kind {
                HeapObjectKind::Function { shared, feedback } => Some((id, shared, feedback)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Is this object callable, per its shape?
    pub fn is_callable(&self, id: ObjectId) -> bool {
        self.shape(self.object(id).shape).is_callable
    }

    /// Is this object a promise?
    pub fn is_promise(&self, id: ObjectId) -> bool {
        matches!(self.object(id).kind, HeapObjectKind::Promise)
    }

    /// Is this object a typed array?
    pub fn is_typed_array(&self, id: ObjectId) -> bool {
        matches!(self.object(id).kind, HeapObjectKind::TypedArray { .. })
    }

    /// Is this object an array?
    pub fn is_array(&self, id: ObjectId) -> bool {
        matches!(self.object(id).kind, HeapObjectKind::Array { .. })
    }

    /// An own element of an array-like object at a constant index, if the
    /// element snapshot has one.
    pub fn own_constant_element(&self, id: ObjectId, index: u32) -> Option<Constant> {
        match &self.object(id).kind {
            HeapObjectKind::Array { elements, .. } => elements.get(index as usize).copied(),
            _ => None,
        }
    }

    /// Does the array's backing store use copy-on-write elements?
    pub fn has_cow_elements(&self, id: ObjectId) -> bool {
        matches!(self.object(id).kind, HeapObjectKind::Array { cow: true, .. })
    }

    /// The property cell backing a global, if one is installed.
    pub fn global_cell(&self, name: NameId) -> Option<ObjectId> {
        self.global_cells.get(&name).copied()
    }

    /// The global name a property cell is registered under.
    pub fn global_cell_name(&self, cell: ObjectId) -> Option<NameId> {
        self.global_cells
            .iter()
            .find(|(_, &c)| c == cell)
            .map(|(&name, _)| name)
    }

    /// The value held by a property cell.
    pub fn cell_value(&self, cell: ObjectId) -> Option<Constant> {
        match self.object(cell).kind {
            HeapObjectKind::PropertyCell { value } => Some(value),
            _ => None,
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_interning() {
        let mut names = NameTable::new();
        let a = names.intern("x");
        let b = names.intern("x");
        assert_eq!(a, b);
        assert_eq!(names.get(a), "x");
        assert_eq!(names.get(names.well_known().prototype), "prototype");
    }

    #[test]
    fn test_global_proxy_is_seeded() {
        let heap = Heap::new();
        let proxy = heap.native_context().global_proxy;
        assert!(matches!(
            heap.object(proxy).kind,
            HeapObjectKind::GlobalProxy
        ));
    }

    #[test]
    fn test_function_decomposition() {
        let mut heap = Heap::new();
        let chunk = BytecodeChunk::new(1, 0);
        let shared = heap.add_shared(SharedFunctionInfo::with_bytecode("f", chunk));
        let vector = heap.add_vector(FeedbackVector::default());
        let closure = heap.add_function(shared, Some(vector));

        let (object, s, v) = heap.as_function(Constant::Heap(closure)).unwrap();
        assert_eq!(object, closure);
        assert_eq!(s, shared);
        assert_eq!(v, Some(vector));
        assert!(heap.is_callable(closure));
        assert!(heap.as_function(Constant::Smi(1)).is_none());
    }

    #[test]
    fn test_shape_descriptor_lookup() {
        let mut heap = Heap::new();
        let name = heap.names.intern("x");
        let other = heap.names.intern("y");
        let shape = heap.add_shape(Shape {
            descriptors: vec![(name, 0)],
            ..Shape::default()
        });
        assert_eq!(heap.shape(shape).lookup_descriptor(name), Some(0));
        assert_eq!(heap.shape(shape).lookup_descriptor(other), None);
    }

    #[test]
    fn test_own_constant_element() {
        let mut heap = Heap::new();
        let shape = heap.add_shape(Shape::default());
        let array = heap.add_object(HeapObject {
            shape,
            kind: HeapObjectKind::Array {
                elements: vec![Constant::Smi(10), Constant::Smi(20)],
                cow: true,
            },
        });
        assert_eq!(heap.own_constant_element(array, 1), Some(Constant::Smi(20)));
        assert_eq!(heap.own_constant_element(array, 5), None);
        assert!(heap.has_cow_elements(array));
    }
}
