use alloc::string::String;

/// An error raised while assembling a WebAssembly module.
#[derive(Debug, Clone, PartialEq, Eq, onlyerror::Error)]
pub enum BuildError {
    /// An append would overrun the buffer's fixed capacity.
    #[error("buffer full: append of {requested} byte(s) exceeds capacity {capacity}")]
    BufferFull {
        /// Number of bytes the append needed.
        requested: usize,
        /// The buffer's fixed capacity.
        capacity: usize,
    },
    /// A byte append received a value outside `[0, 255]`.
    #[error("byte value {0} is outside [0, 255]")]
    ByteOutOfRange(u32),
    /// A function type or function re-used an existing name.
    #[error("`{0}` is already defined")]
    DuplicateName(String),
    /// A permanent type was defined after a per-compilation type.
    #[error("permanent type `{0}` defined after a per-compilation type")]
    InvalidPermanentOrdering(String),
    /// Reference to a function type that was never defined.
    #[error("unknown function type `{0}`")]
    UnknownType(String),
    /// Reference to a name missing from the current local map.
    #[error("unknown local `{0}`")]
    UnknownLocal(String),
    /// `call_import` for a name that was never defined.
    #[error("unknown import `{0}`")]
    UnknownImport(String),
    /// Attempt to pop the base buffer off the buffer stack.
    #[error("attempted to pop the base buffer")]
    StackEmpty,
    /// A function ended while blocks were still open.
    #[error("function ended with {0} block(s) still open")]
    UnclosedBlocks(u32),
    /// The LEB128 encoder reported failure.
    #[error("LEB128 encoder failed")]
    EncoderFailure,
    /// Attempt to install a null function pointer into the indirect table.
    #[error("attempted to install a null function pointer")]
    NullFunction,
}
