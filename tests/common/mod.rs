//! Shared test helpers for integration tests

use foresight::broker::HeapBroker;
use foresight::bytecode::BytecodeChunk;
use foresight::heap::feedback::{FeedbackSlotData, FeedbackVector};
use foresight::heap::{Heap, ObjectId, SharedFunctionInfo, SharedId, VectorId};
use foresight::serializer::{HintSerializer, Hints, SerializerFlags};

/// Install a bytecode function: shared info, feedback vector and closure.
pub fn install_function(
    heap: &mut Heap,
    name: &str,
    chunk: BytecodeChunk,
    vector: FeedbackVector,
) -> (ObjectId, SharedId, VectorId) {
    let shared = heap.add_shared(SharedFunctionInfo::with_bytecode(name, chunk));
    let vector = heap.add_vector(vector);
    let closure = heap.add_function(shared, Some(vector));
    (closure, shared, vector)
}

/// A feedback vector whose first `count` slots have observed nothing.
#[allow(dead_code)]
pub fn vector_with_uninitialized_slots(count: usize) -> FeedbackVector {
    let mut vector = FeedbackVector::default();
    for _ in 0..count {
        vector.add_slot(FeedbackSlotData::uninitialized());
    }
    vector
}

/// Analyze a closure and return its hints plus the broker for inspecting
/// caches and snapshots.
pub fn analyze<'h>(heap: &'h Heap, closure: ObjectId) -> (Hints, HeapBroker<'h>) {
    analyze_with_flags(heap, closure, SerializerFlags::default())
}

/// Analyze a closure under explicit flags.
pub fn analyze_with_flags<'h>(
    heap: &'h Heap,
    closure: ObjectId,
    flags: SerializerFlags,
) -> (Hints, HeapBroker<'h>) {
    init_tracing();
    let mut broker = HeapBroker::new(heap);
    let hints = HintSerializer::for_closure(&mut broker, closure, flags)
        .expect("analysis subject is malformed")
        .run();
    (hints, broker)
}

/// Install a subscriber so `RUST_LOG=trace` shows the walk under test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
