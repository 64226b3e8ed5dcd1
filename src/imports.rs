//! Imported functions and their lazily assigned indices.

use crate::errors::BuildError;
use crate::indices::{ImportIndex, TypeIndex};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use cranelift_entity::EntityRef;
use hashbrown::HashMap;

/// An imported function.
///
/// The index stays unassigned until the import is declared `assume_used` or
/// first referenced by a call, so unused declarations cost nothing in the
/// emitted module. Assigned indices are densely packed from 0 in
/// first-use order.
#[derive(Debug, Clone)]
pub struct ImportedFunction {
    pub module: String,
    /// Field name in the import entry.
    pub field: String,
    pub type_index: TypeIndex,
    pub index: Option<ImportIndex>,
}

#[derive(Debug, Default)]
pub struct ImportRegistry {
    /// Keyed by the friendly name call sites use.
    functions: HashMap<String, ImportedFunction>,
    assigned: u32,
}

impl ImportRegistry {
    /// Declares an import under `friendly_name`, replacing any previous
    /// declaration with that name.
    pub fn define(
        &mut self,
        module: &str,
        friendly_name: &str,
        field: &str,
        type_index: TypeIndex,
        assume_used: bool,
    ) {
        let index = assume_used.then(|| {
            let index = ImportIndex::new(self.assigned as usize);
            self.assigned += 1;
            index
        });
        self.functions.insert(
            friendly_name.to_string(),
            ImportedFunction {
                module: module.to_string(),
                field: field.to_string(),
                type_index,
                index,
            },
        );
    }

    /// Resolves the call index for `friendly_name`, assigning the next
    /// import index on first use.
    pub fn index_for_call(&mut self, friendly_name: &str) -> crate::Result<ImportIndex> {
        let func = self
            .functions
            .get_mut(friendly_name)
            .ok_or_else(|| BuildError::UnknownImport(friendly_name.to_string()))?;
        Ok(match func.index {
            Some(index) => index,
            None => {
                let index = ImportIndex::new(self.assigned as usize);
                self.assigned += 1;
                func.index = Some(index);
                tracing::trace!("import `{friendly_name}` assigned {index:?}");
                index
            }
        })
    }

    pub fn get(&self, friendly_name: &str) -> Option<&ImportedFunction> {
        self.functions.get(friendly_name)
    }

    /// Number of imports with an assigned index.
    pub fn assigned_count(&self) -> u32 {
        self.assigned
    }

    /// Assigned imports in ascending index order.
    pub fn in_index_order(&self) -> Vec<&ImportedFunction> {
        let mut used: Vec<&ImportedFunction> = self
            .functions
            .values()
            .filter(|func| func.index.is_some())
            .collect();
        used.sort_by_key(|func| func.index);
        used
    }

    pub fn clear(&mut self) {
        self.functions.clear();
        self.assigned = 0;
    }
}
