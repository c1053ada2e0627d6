//! Allocation tags and per-tag behaviour.
//!
//! Every payload carries a 6-bit tag naming what kind of object it holds. The
//! collector asks the [`TagTable`](struct.TagTable.html) what to do with an
//! object: which heap pointers it holds while marking, and how to clean it up
//! before its memory is reclaimed. Tags with no registered handler, including
//! tag 0 for plain buffers, hold no pointers and need no cleanup.

use crate::collector::Visitor;
use crate::meta;

macro_rules! alloc_tags {
    ($($name:ident = $value:expr,)*) => {
        /// The kinds of object a runtime allocates.
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum AllocTag {
            $($name = $value,)*
        }

        impl AllocTag {
            pub const ALL: &'static [AllocTag] = &[$(AllocTag::$name,)*];

            pub fn from_u8(value: u8) -> Option<AllocTag> {
                match value {
                    $($value => Some(AllocTag::$name),)*
                    _ => None,
                }
            }
        }
    };
}

alloc_tags! {
    Plain = 0,
    WithoutPtr = 1,
    LepusRef = 2,
    String = 3,
    ConstString = 4,
    SeparableString = 5,
    Symbol = 6,
    Shape = 7,
    VarRef = 8,
    FunctionBytecode = 9,
    Object = 10,
    BoundFunction = 11,
    CFunctionDataRecord = 12,
    ForInIterator = 13,
    ArrayBuffer = 14,
    TypedArray = 15,
    MapState = 16,
    MapIteratorData = 17,
    ArrayIteratorData = 18,
    RegExpStringIteratorData = 19,
    GeneratorData = 20,
    ProxyData = 21,
    PromiseData = 22,
    PromiseReactionData = 23,
    PromiseFunctionData = 24,
    AsyncFunctionData = 25,
    AsyncFromSyncIteratorData = 26,
    AsyncGeneratorData = 27,
    ScriptSource = 28,
    PropertyEnum = 29,
    ModuleDef = 30,
    FunctionDef = 31,
    ValueArray = 32,
    ValueSlot = 33,
    JsonStrArray = 34,
    DebuggerInfo = 35,
    FinalizationRegistryData = 36,
    WeakRefData = 37,
    BigFloat = 38,
}

impl AllocTag {
    /// The tag stored on `mem`, or `None` for a value no variant names.
    ///
    /// # Safety
    ///
    /// `mem` must be a live payload of a heap in this crate.
    pub unsafe fn of(mem: *mut u8) -> Option<AllocTag> {
        AllocTag::from_u8(meta::get_alloc_tag(mem))
    }

    /// # Safety
    ///
    /// `mem` must be a live payload of a heap in this crate.
    pub unsafe fn apply(self, mem: *mut u8) {
        meta::set_alloc_tag(mem, self as u8);
    }
}

/// Why a finalizer is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeMode {
    /// The object was found unreachable by a collection.
    Collect,
    /// The heap is being torn down; every live object is finalized once.
    Teardown,
}

/// What the collector does with objects of one tag.
pub trait TagHandler {
    /// Push every heap pointer held by `mem` onto `visitor`.
    ///
    /// # Safety
    ///
    /// `mem` is a live, marked payload carrying this handler's tag.
    unsafe fn visit(&self, _mem: *mut u8, _visitor: &mut Visitor) {}

    /// Release whatever `mem` owns outside the heap. Runs before the memory is
    /// reclaimed; the heap itself must not be touched.
    ///
    /// # Safety
    ///
    /// `mem` is a live payload carrying this handler's tag.
    unsafe fn finalize(&self, _mem: *mut u8, _mode: FinalizeMode) {}
}

const TAG_SLOTS: usize = 1 << meta::TAG_BITS;

/// Handlers indexed by tag.
pub struct TagTable {
    handlers: Vec<Option<Box<dyn TagHandler>>>,
}

impl Default for TagTable {
    fn default() -> Self {
        TagTable::new()
    }
}

impl TagTable {
    pub fn new() -> Self {
        TagTable {
            handlers: (0..TAG_SLOTS).map(|_| None).collect(),
        }
    }

    /// Install `handler` for `tag`, returning the one it replaces.
    pub fn register<H: TagHandler + 'static>(
        &mut self,
        tag: AllocTag,
        handler: H,
    ) -> Option<Box<dyn TagHandler>> {
        self.handlers[tag as usize].replace(Box::new(handler))
    }

    pub fn unregister(&mut self, tag: AllocTag) -> Option<Box<dyn TagHandler>> {
        self.handlers[tag as usize].take()
    }

    pub fn is_registered(&self, tag: AllocTag) -> bool {
        self.handlers[tag as usize].is_some()
    }

    fn handler(&self, mem: *mut u8) -> Option<&dyn TagHandler> {
        let tag = unsafe { meta::get_alloc_tag(mem) } as usize;
        self.handlers[tag].as_ref().map(|h| h.as_ref())
    }

    /// # Safety
    ///
    /// `mem` must be a live, marked payload.
    pub unsafe fn visit(&self, mem: *mut u8, visitor: &mut Visitor) {
        if let Some(h) = self.handler(mem) {
            h.visit(mem, visitor);
        }
    }

    /// # Safety
    ///
    /// `mem` must be a live payload about to be reclaimed or torn down.
    pub unsafe fn finalize(&self, mem: *mut u8, mode: FinalizeMode) {
        if let Some(h) = self.handler(mem) {
            h.finalize(mem, mode);
        }
    }
}
