//! GC object layout
//!
//! Objects never hold raw addresses of each other. Every reference is an
//! [`ObjectRef`] handle resolved through the heap's handle table, so moving an
//! object only rewrites one table entry.

use std::fmt;

use crate::barrier::BarrierTicket;

/// Bytes charged for every object header
pub const HEADER_BYTES: usize = 16;

/// Bytes per reference slot
pub const WORD_BYTES: usize = 8;

/// Round `size` up to a whole number of words
#[inline]
pub const fn align_to_word(size: usize) -> usize {
    (size + WORD_BYTES - 1) & !(WORD_BYTES - 1)
}

/// Stable handle to a heap object
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    index: u32,
    generation: u32,
}

impl ObjectRef {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot in the handle table
    pub fn index(self) -> u32 {
        self.index
    }

    /// Reuse generation of the handle slot
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Weak reference to a class; the class registry owns the class itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassRef(pub u32);

impl ClassRef {
    /// Fixed-capacity field storage
    pub const TUPLE: ClassRef = ClassRef(1);
    /// Growable view over a tuple
    pub const ARRAY: ClassRef = ClassRef(2);
    /// Raw byte storage
    pub const BYTE_ARRAY: ClassRef = ClassRef(3);
    /// Boxed float
    pub const FLOAT: ClassRef = ClassRef(4);
    /// First id available to user classes
    pub const FIRST_USER: u32 = 16;

    /// True for the built-in class refs
    pub fn is_builtin(self) -> bool {
        self.0 < Self::FIRST_USER
    }
}

/// Capability interface for dynamically defined classes
///
/// Built-in kinds are a closed set ([`ObjectKind`]); anything else is an
/// `Instance` whose layout is described by its class.
pub trait ObjectClass: Send + Sync {
    /// Weak reference stored in every instance header
    fn class_ref(&self) -> ClassRef;

    /// Number of inline reference fields in an instance
    fn instance_fields(&self) -> usize;

    /// Class name, for diagnostics
    fn name(&self) -> &str;
}

/// A value stored in a field slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Value {
    /// The empty reference
    #[default]
    Nil,
    /// Boolean immediate
    Bool(bool),
    /// Integer immediate
    Fixnum(i64),
    /// Reference to a heap object
    Ref(ObjectRef),
}

impl Value {
    /// The heap object referenced, if any
    #[inline]
    pub fn as_object(self) -> Option<ObjectRef> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// True for `Nil`
    #[inline]
    pub fn is_nil(self) -> bool {
        matches!(self, Value::Nil)
    }
}

impl From<ObjectRef> for Value {
    fn from(r: ObjectRef) -> Self {
        Value::Ref(r)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Fixnum(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Mark color for tri-color marking
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkColor {
    /// Not yet visited
    White = 0,
    /// In worklist
    Gray = 1,
    /// Fully scanned
    Black = 2,
}

/// Object header
///
/// Only the owning mutator (under the heap lock) or the collector while the
/// world is stopped mutates a header.
#[derive(Debug, Clone)]
pub struct GcHeader {
    class: ClassRef,
    size: usize,
    mark: MarkColor,
    frozen: bool,
    /// Cycles survived
    age: u8,
}

impl GcHeader {
    /// Create new header
    pub fn new(class: ClassRef, size: usize) -> Self {
        Self {
            class,
            size,
            mark: MarkColor::White,
            frozen: false,
            age: 0,
        }
    }

    /// Class of the object
    pub fn class(&self) -> ClassRef {
        self.class
    }

    /// Bytes charged for the object, header included
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get mark color
    pub fn mark(&self) -> MarkColor {
        self.mark
    }

    /// Set mark color
    pub fn set_mark(&mut self, color: MarkColor) {
        self.mark = color;
    }

    /// True once frozen
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Number of collections survived
    pub fn age(&self) -> u8 {
        self.age
    }

    pub(crate) fn bump_age(&mut self) {
        self.age = self.age.saturating_add(1);
    }
}

/// Built-in object kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Instance of a dynamic class with inline fields
    Instance,
    /// Fixed-capacity field storage
    Tuple,
    /// Growable view over a tuple
    Array,
    /// Raw bytes
    ByteArray,
    /// Boxed float
    Float,
}

/// Reference slots of an instance or tuple
///
/// Capacity is fixed at creation. Slots can only be written with a
/// [`BarrierTicket`], which only the write barrier hands out.
#[derive(Debug, Clone)]
pub struct Fields {
    slots: Box<[Value]>,
}

impl Fields {
    /// Create `capacity` slots, all `Nil`
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![Value::Nil; capacity].into_boxed_slice(),
        }
    }

    /// Number of slots
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when there are no slots
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot value, `None` past the end
    #[inline]
    pub fn get(&self, index: usize) -> Option<Value> {
        self.slots.get(index).copied()
    }

    /// All slots
    pub fn as_slice(&self) -> &[Value] {
        &self.slots
    }

    /// Store the value approved by the barrier
    #[inline]
    pub(crate) fn put(&mut self, index: usize, ticket: BarrierTicket) {
        self.slots[index] = ticket.into_value();
    }
}

/// Header of a growable view: the logical window `(start, total)` over its
/// backing tuple
#[derive(Debug, Clone, Copy)]
pub struct ViewHeader {
    start: usize,
    total: usize,
    storage: ObjectRef,
}

impl ViewHeader {
    pub(crate) fn new(storage: ObjectRef) -> Self {
        Self {
            start: 0,
            total: 0,
            storage,
        }
    }

    /// Offset of the first logical element
    pub fn start(&self) -> usize {
        self.start
    }

    /// Logical element count
    pub fn total(&self) -> usize {
        self.total
    }

    /// Backing tuple
    pub fn storage(&self) -> ObjectRef {
        self.storage
    }

    pub(crate) fn set_window(&mut self, start: usize, total: usize) {
        self.start = start;
        self.total = total;
    }

    /// Swap the backing tuple; the ticket must carry the new tuple
    pub(crate) fn replace_storage(&mut self, ticket: BarrierTicket) {
        match ticket.into_value() {
            Value::Ref(storage) => self.storage = storage,
            other => unreachable!("view storage must be a tuple, got {other:?}"),
        }
    }
}

/// Object payload
#[derive(Debug, Clone)]
pub enum ObjectBody {
    /// Inline fields of a dynamic class instance
    Instance(Fields),
    /// Fixed-capacity field storage
    Tuple(Fields),
    /// Growable view
    Array(ViewHeader),
    /// Raw bytes, zero-initialised
    ByteArray(Box<[u8]>),
    /// Boxed float
    Float(f64),
}

impl ObjectBody {
    /// Kind tag
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectBody::Instance(_) => ObjectKind::Instance,
            ObjectBody::Tuple(_) => ObjectKind::Tuple,
            ObjectBody::Array(_) => ObjectKind::Array,
            ObjectBody::ByteArray(_) => ObjectKind::ByteArray,
            ObjectBody::Float(_) => ObjectKind::Float,
        }
    }

    /// Bytes charged for this payload plus header
    pub fn byte_size(&self) -> usize {
        let payload = match self {
            ObjectBody::Instance(fields) | ObjectBody::Tuple(fields) => fields.len() * WORD_BYTES,
            ObjectBody::Array(_) => 3 * WORD_BYTES,
            ObjectBody::ByteArray(bytes) => align_to_word(bytes.len()),
            ObjectBody::Float(_) => WORD_BYTES,
        };
        HEADER_BYTES + payload
    }

    /// Visit every outgoing reference
    pub fn trace(&self, tracer: &mut dyn FnMut(ObjectRef)) {
        match self {
            ObjectBody::Instance(fields) | ObjectBody::Tuple(fields) => {
                for value in fields.as_slice() {
                    if let Value::Ref(r) = value {
                        tracer(*r);
                    }
                }
            }
            ObjectBody::Array(view) => tracer(view.storage),
            ObjectBody::ByteArray(_) | ObjectBody::Float(_) => {}
        }
    }
}

/// A heap-resident object
#[derive(Debug)]
pub struct HeapObject {
    pub(crate) handle: ObjectRef,
    pub(crate) header: GcHeader,
    pub(crate) body: ObjectBody,
}

impl HeapObject {
    pub(crate) fn new(handle: ObjectRef, class: ClassRef, body: ObjectBody) -> Self {
        let size = body.byte_size();
        Self {
            handle,
            header: GcHeader::new(class, size),
            body,
        }
    }

    /// Handle naming this object
    pub fn handle(&self) -> ObjectRef {
        self.handle
    }

    /// Header
    pub fn header(&self) -> &GcHeader {
        &self.header
    }

    /// Payload
    pub fn body(&self) -> &ObjectBody {
        &self.body
    }

    /// Outgoing references
    pub fn children(&self) -> Vec<ObjectRef> {
        let mut out = Vec::new();
        self.body.trace(&mut |r| out.push(r));
        out
    }
}
