//! Function records and the per-function local map.

use crate::builder::ModuleBuilder;
use crate::errors::BuildError;
use crate::indices::{LocalIndex, TypeIndex};
use crate::values::ValType;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use cranelift_entity::EntityRef;
use hashbrown::HashMap;
use smallvec::SmallVec;

/// Streams a function body into the builder. Runs exactly once, when the
/// module's imports and functions are emitted.
pub type FunctionGenerator = Box<dyn FnOnce(&mut ModuleBuilder) -> crate::Result<()>>;

/// A function registered with [`ModuleBuilder::define_function`].
pub struct FunctionRecord {
    pub name: String,
    pub type_name: String,
    pub type_index: TypeIndex,
    pub export: bool,
    /// Extra locals in declaration order, before valtype grouping.
    pub locals: Vec<(String, ValType)>,
    pub(crate) generator: Option<FunctionGenerator>,
    /// The captured body blob: local prologue plus the generator's opcode
    /// stream. On generator failure this holds the partial body, kept
    /// around for dumping.
    pub body: Option<Vec<u8>>,
    pub error: Option<BuildError>,
}

impl fmt::Debug for FunctionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRecord")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("type_index", &self.type_index)
            .field("export", &self.export)
            .field("locals", &self.locals)
            .field("body_len", &self.body.as_ref().map(Vec::len))
            .field("error", &self.error)
            .finish()
    }
}

/// Name → (valtype, index) mapping for the function currently being
/// emitted.
#[derive(Debug, Default)]
pub struct LocalMap {
    by_name: HashMap<String, (ValType, LocalIndex)>,
    param_count: u32,
    /// Present local groups in canonical order, as (valtype, count).
    groups: SmallVec<[(ValType, u32); 4]>,
}

impl LocalMap {
    /// Recomputes the map for a new function: parameters first in
    /// declaration order, then locals grouped i32 → i64 → f32 → f64,
    /// keeping declaration order within each group.
    pub(crate) fn rebuild<S: AsRef<str>>(
        &mut self,
        params: &[(String, ValType)],
        locals: &[(S, ValType)],
    ) {
        self.by_name.clear();
        self.groups.clear();
        self.param_count = params.len() as u32;

        for (i, (name, ty)) in params.iter().enumerate() {
            self.by_name
                .insert(name.clone(), (*ty, LocalIndex::new(i)));
        }

        let mut next = params.len();
        for group in ValType::GROUP_ORDER {
            let mut count = 0u32;
            for (name, ty) in locals {
                if *ty != group {
                    continue;
                }
                self.by_name
                    .insert(String::from(name.as_ref()), (*ty, LocalIndex::new(next)));
                next += 1;
                count += 1;
            }
            if count > 0 {
                self.groups.push((group, count));
            }
        }
    }

    pub fn resolve(&self, name: &str) -> Option<(ValType, LocalIndex)> {
        self.by_name.get(name).copied()
    }

    pub fn param_count(&self) -> u32 {
        self.param_count
    }

    pub(crate) fn groups(&self) -> &[(ValType, u32)] {
        &self.groups
    }

    pub(crate) fn clear(&mut self) {
        self.by_name.clear();
        self.groups.clear();
        self.param_count = 0;
    }
}
