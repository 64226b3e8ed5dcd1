//! Interning of function types.
//!
//! Modules produced by the trace compiler repeat a handful of signatures
//! over and over, so types are interned by structural shape: one index per
//! distinct shape, however many names refer to it. Types marked permanent
//! are defined once at startup, keep stable low indices and survive
//! [`TypeRegistry::clear`]; everything else lives for one compilation.

use crate::errors::BuildError;
use crate::indices::TypeIndex;
use crate::values::ValType;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use cranelift_entity::EntityRef;
use hashbrown::HashMap;
use smallvec::SmallVec;

/// The structural shape of a function type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionTypeShape {
    pub params: SmallVec<[ValType; 4]>,
    pub result: Option<ValType>,
}

/// A named function type: the interned index plus the parameter names the
/// local map is seeded from.
#[derive(Debug, Clone)]
pub struct NamedFunctionType {
    pub index: TypeIndex,
    pub params: Vec<(String, ValType)>,
    pub result: Option<ValType>,
}

#[derive(Debug, Default)]
pub struct TypeRegistry {
    /// Every distinct shape, indexed by `TypeIndex`. The permanent shapes
    /// form the prefix `[0, permanent_len)`.
    shapes: Vec<FunctionTypeShape>,
    permanent_len: usize,
    /// Shape → index, consulted per-compilation first, permanent second.
    by_shape: HashMap<FunctionTypeShape, TypeIndex>,
    permanent_by_shape: HashMap<FunctionTypeShape, TypeIndex>,
    /// Name → type info, split the same way.
    by_name: HashMap<String, NamedFunctionType>,
    permanent_by_name: HashMap<String, NamedFunctionType>,
}

impl TypeRegistry {
    /// Defines a function type under `name`, interning its shape.
    ///
    /// Returns the existing index when an identical shape was already
    /// defined, under whatever name.
    pub fn define(
        &mut self,
        name: &str,
        params: Vec<(String, ValType)>,
        result: Option<ValType>,
        permanent: bool,
    ) -> crate::Result<TypeIndex> {
        if self.by_name.contains_key(name) || self.permanent_by_name.contains_key(name) {
            return Err(BuildError::DuplicateName(name.to_string()));
        }
        if permanent && self.shapes.len() > self.permanent_len {
            return Err(BuildError::InvalidPermanentOrdering(name.to_string()));
        }

        let shape = FunctionTypeShape {
            params: params.iter().map(|(_, ty)| *ty).collect(),
            result,
        };
        let existing = self
            .by_shape
            .get(&shape)
            .or_else(|| self.permanent_by_shape.get(&shape))
            .copied();
        let index = match existing {
            Some(index) => index,
            None => {
                let index = TypeIndex::new(self.shapes.len());
                self.shapes.push(shape.clone());
                if permanent {
                    self.permanent_by_shape.insert(shape, index);
                    self.permanent_len = self.shapes.len();
                } else {
                    self.by_shape.insert(shape, index);
                }
                index
            }
        };
        tracing::trace!("defined {}type `{name}` as {index:?}", if permanent { "permanent " } else { "" });

        let info = NamedFunctionType {
            index,
            params,
            result,
        };
        if permanent {
            self.permanent_by_name.insert(name.to_string(), info);
        } else {
            self.by_name.insert(name.to_string(), info);
        }
        Ok(index)
    }

    /// Looks a type up by name, per-compilation names shadowing permanent
    /// ones.
    pub fn get(&self, name: &str) -> Option<&NamedFunctionType> {
        self.by_name
            .get(name)
            .or_else(|| self.permanent_by_name.get(name))
    }

    /// Number of distinct shapes, permanent included.
    pub fn count(&self) -> usize {
        self.shapes.len()
    }

    /// Distinct shapes in index order.
    pub fn shapes(&self) -> impl ExactSizeIterator<Item = &FunctionTypeShape> {
        self.shapes.iter()
    }

    /// Drops all per-compilation types. Permanent types keep their indices.
    pub fn clear(&mut self) {
        self.shapes.truncate(self.permanent_len);
        self.by_shape.clear();
        self.by_name.clear();
    }
}
