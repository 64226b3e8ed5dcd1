//! Streaming WebAssembly module assembly for a runtime trace JIT.
//!
//! The interpreter's trace compiler drives a [`ModuleBuilder`] between
//! dispatches: it registers function types and imports, defines functions
//! whose generators stream opcodes into nested body buffers, and finally
//! serialises the canonical section sequence into a module blob ready for
//! instantiation. Everything is synchronous and single-threaded; the one
//! piece of cross-compilation state is the constant-slot table and the
//! permanent types, which survive [`ModuleBuilder::clear`].

extern crate alloc;

mod buffer;
mod builder;
mod errors;
mod functions;
mod imports;
mod indices;
mod leb128;
mod memops;
mod opcodes;
mod options;
mod table;
mod type_registry;
mod values;

pub use buffer::{BufferStack, ByteBuffer, DEFAULT_CAPACITY};
pub use builder::{BuilderConfig, LeaBase, LocalRef, ModuleBuilder};
pub use errors::BuildError;
pub use functions::{FunctionGenerator, FunctionRecord, LocalMap};
pub use imports::ImportedFunction;
pub use indices::{ConstantSlotIndex, FuncIndex, ImportIndex, LocalIndex, TypeIndex};
pub use memops::{
    append_memmove_dest_src, append_memset_dest, try_memmove_fast, try_memset_fast, FRAME_LOCAL,
    MAX_MEMMOVE_SIZE, MAX_MEMSET_SIZE, SCRATCH_LHS, SCRATCH_RHS,
};
pub use opcodes::{MiscOpcode, Opcode, SectionId};
pub use options::{
    apply_named_options, apply_options, FailureTracker, JiterpOptions, OptionKey, OptionValue,
    OptionsCache, OptionsHost, MAX_FAILURES,
};
pub use table::{FunctionTable, TableSlotAllocator, TABLE_GROW_CHUNK};
pub use type_registry::{FunctionTypeShape, NamedFunctionType, TypeRegistry};
pub use values::{BlockType, HeapPtr, Ip, ValType};

pub type Result<T> = core::result::Result<T, BuildError>;
