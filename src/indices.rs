use cranelift_entity::entity_impl;

/// Index of an interned function type in the module's type space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeIndex(u32);
entity_impl!(TypeIndex);

/// Index of an imported function. Assigned lazily, densely packed from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImportIndex(u32);
entity_impl!(ImportIndex);

/// Index of a defined function, in definition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncIndex(u32);
entity_impl!(FuncIndex);

/// Index of a constant slot: one of the imported immutable i32 globals a
/// pointer constant is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstantSlotIndex(u32);
entity_impl!(ConstantSlotIndex);

/// Index of a parameter or local within the current function.
///
/// Parameters occupy `[0, P)` in declaration order; locals follow, grouped
/// by valtype (i32, i64, f32, f64) and in declaration order within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalIndex(u32);
entity_impl!(LocalIndex);
