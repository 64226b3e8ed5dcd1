//! The module builder.
//!
//! Orchestrates the buffer stack and the type/import/function registries
//! behind the emission surface the trace compiler streams opcodes through,
//! and serialises the canonical section sequence (type, import, function,
//! export, code) into the final module blob.

use crate::buffer::{BufferStack, DEFAULT_CAPACITY};
use crate::errors::BuildError;
use crate::functions::{FunctionRecord, LocalMap};
use crate::imports::{ImportRegistry, ImportedFunction};
use crate::indices::{ConstantSlotIndex, FuncIndex, TypeIndex};
use crate::opcodes::{Opcode, SectionId};
use crate::type_registry::TypeRegistry;
use crate::values::{BlockType, HeapPtr, Ip, ValType};
use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::mem;
use cranelift_entity::{EntityRef, PrimaryMap};
use hashbrown::HashSet;

/// Construction-time settings for a [`ModuleBuilder`].
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Capacity of each buffer in the stack.
    pub buffer_capacity: usize,
    /// Length of the constant-slot table. Zero disables the mechanism and
    /// every `ptr_const` inlines its pointer.
    pub constant_slot_count: usize,
    /// When set, a failing generator is recorded on its function record
    /// and emission continues with the next function. Off by default:
    /// generator errors propagate, with the partial body still captured.
    pub tolerate_generator_failures: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_CAPACITY,
            constant_slot_count: 0,
            tolerate_generator_failures: false,
        }
    }
}

/// Reference to a parameter or local: by name, or by zero-based index.
#[derive(Debug, Clone, Copy)]
pub enum LocalRef<'a> {
    Name(&'a str),
    Index(u32),
}

impl<'a> From<&'a str> for LocalRef<'a> {
    fn from(name: &'a str) -> Self {
        LocalRef::Name(name)
    }
}

impl From<u32> for LocalRef<'_> {
    fn from(index: u32) -> Self {
        LocalRef::Index(index)
    }
}

/// Base operand of an address computation: a local holding a pointer, or a
/// constant address.
#[derive(Debug, Clone, Copy)]
pub enum LeaBase<'a> {
    Local(&'a str),
    Address(i32),
}

impl<'a> From<&'a str> for LeaBase<'a> {
    fn from(name: &'a str) -> Self {
        LeaBase::Local(name)
    }
}

impl From<i32> for LeaBase<'_> {
    fn from(addr: i32) -> Self {
        LeaBase::Address(addr)
    }
}

pub struct ModuleBuilder {
    stack: BufferStack,
    types: TypeRegistry,
    imports: ImportRegistry,
    functions: PrimaryMap<FuncIndex, FunctionRecord>,
    function_names: HashSet<String>,
    locals: LocalMap,
    active_blocks: u32,
    back_branch_offsets: Vec<u32>,
    /// Pointers bound to constant slots so far. Survives `clear`: the host
    /// re-binds the whole table at each instantiation.
    constant_slots: PrimaryMap<ConstantSlotIndex, HeapPtr>,
    constant_slot_count: usize,
    base: Ip,
    tolerate_generator_failures: bool,
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new(BuilderConfig::default())
    }
}

impl ModuleBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        Self {
            stack: BufferStack::new(config.buffer_capacity),
            types: TypeRegistry::default(),
            imports: ImportRegistry::default(),
            functions: PrimaryMap::new(),
            function_names: HashSet::new(),
            locals: LocalMap::default(),
            active_blocks: 0,
            back_branch_offsets: Vec::new(),
            constant_slots: PrimaryMap::with_capacity(config.constant_slot_count),
            constant_slot_count: config.constant_slot_count,
            base: Ip::new(0),
            tolerate_generator_failures: config.tolerate_generator_failures,
        }
    }

    /// Resets all per-compilation state. Permanent types and constant
    /// slots keep their assignments.
    pub fn clear(&mut self) {
        self.stack.clear();
        self.types.clear();
        self.imports.clear();
        self.functions = PrimaryMap::new();
        self.function_names.clear();
        self.locals.clear();
        self.active_blocks = 0;
        self.back_branch_offsets.clear();
    }

    /// Sets the trace base address `ip_const` rebases against.
    pub fn set_base(&mut self, base: Ip) {
        self.base = base;
    }

    pub fn base(&self) -> Ip {
        self.base
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    /// Defines a function type. Structurally equal shapes share an index.
    pub fn define_type(
        &mut self,
        name: &str,
        params: &[(&str, ValType)],
        result: Option<ValType>,
        permanent: bool,
    ) -> crate::Result<TypeIndex> {
        let params: Vec<(String, ValType)> = params
            .iter()
            .map(|(name, ty)| ((*name).to_string(), *ty))
            .collect();
        self.types.define(name, params, result, permanent)
    }

    /// Declares an imported function under `name`. The import-section
    /// entry uses `wasm_name` (defaulting to `name`) as its field name.
    pub fn define_imported_function(
        &mut self,
        module: &str,
        name: &str,
        type_name: &str,
        assume_used: bool,
        wasm_name: Option<&str>,
    ) -> crate::Result<()> {
        let ty = self
            .types
            .get(type_name)
            .ok_or_else(|| BuildError::UnknownType(type_name.to_string()))?;
        let type_index = ty.index;
        self.imports.define(
            module,
            name,
            wasm_name.unwrap_or(name),
            type_index,
            assume_used,
        );
        Ok(())
    }

    /// Registers a function; its generator runs when
    /// [`emit_imports_and_functions`](Self::emit_imports_and_functions)
    /// assembles the module.
    pub fn define_function(
        &mut self,
        name: &str,
        type_name: &str,
        export: bool,
        locals: &[(&str, ValType)],
        generator: impl FnOnce(&mut ModuleBuilder) -> crate::Result<()> + 'static,
    ) -> crate::Result<FuncIndex> {
        let ty = self
            .types
            .get(type_name)
            .ok_or_else(|| BuildError::UnknownType(type_name.to_string()))?;
        let type_index = ty.index;
        if !self.function_names.insert(name.to_string()) {
            return Err(BuildError::DuplicateName(name.to_string()));
        }
        let index = self.functions.push(FunctionRecord {
            name: name.to_string(),
            type_name: type_name.to_string(),
            type_index,
            export,
            locals: locals
                .iter()
                .map(|(name, ty)| ((*name).to_string(), *ty))
                .collect(),
            generator: Some(Box::new(generator)),
            body: None,
            error: None,
        });
        tracing::trace!("defined function `{name}` ({index:?})");
        Ok(index)
    }

    // ------------------------------------------------------------------
    // Function emission
    // ------------------------------------------------------------------

    /// Starts emitting a function body: rebuilds the local map, pushes the
    /// body buffer and writes the local prologue.
    pub fn begin_function<S: AsRef<str>>(
        &mut self,
        type_name: &str,
        locals: &[(S, ValType)],
    ) -> crate::Result<()> {
        let ty = self
            .types
            .get(type_name)
            .ok_or_else(|| BuildError::UnknownType(type_name.to_string()))?;
        self.locals.rebuild(&ty.params, locals);
        self.active_blocks = 0;
        self.back_branch_offsets.clear();
        self.stack.push();

        let buf = self.stack.current_mut();
        buf.append_uleb(self.locals.groups().len() as u64)?;
        for (ty, count) in self.locals.groups() {
            buf.append_uleb(u64::from(*count))?;
            buf.append_u8(*ty)?;
        }
        Ok(())
    }

    /// Ends the current function body. With `write_to_output` the body is
    /// spliced length-prefixed into the parent buffer; otherwise its bytes
    /// are returned.
    pub fn end_function(&mut self, write_to_output: bool) -> crate::Result<Option<Vec<u8>>> {
        if self.active_blocks != 0 {
            return Err(BuildError::UnclosedBlocks(self.active_blocks));
        }
        if write_to_output {
            self.stack.pop_into_parent()?;
            Ok(None)
        } else {
            Ok(Some(self.stack.pop_bytes()?))
        }
    }

    /// The local map of the function currently being emitted.
    pub fn locals(&self) -> &LocalMap {
        &self.locals
    }

    /// Emits a parameter access (`local.get` unless overridden). A numeric
    /// reference is an absolute local index.
    pub fn arg<'a>(
        &mut self,
        local: impl Into<LocalRef<'a>>,
        opcode: Opcode,
    ) -> crate::Result<usize> {
        let index = self.resolve_local(local.into(), 0)?;
        let buf = self.stack.current_mut();
        let offset = buf.append_u8(opcode)?;
        buf.append_uleb(u64::from(index))?;
        Ok(offset)
    }

    /// Emits a local access. A numeric reference is biased by the
    /// parameter count, so `0` is the first declared local.
    pub fn local<'a>(
        &mut self,
        local: impl Into<LocalRef<'a>>,
        opcode: Opcode,
    ) -> crate::Result<usize> {
        let index = self.resolve_local(local.into(), self.locals.param_count())?;
        let buf = self.stack.current_mut();
        let offset = buf.append_u8(opcode)?;
        buf.append_uleb(u64::from(index))?;
        Ok(offset)
    }

    fn resolve_local(&self, local: LocalRef<'_>, bias: u32) -> crate::Result<u32> {
        match local {
            LocalRef::Name(name) => self
                .locals
                .resolve(name)
                .map(|(_, index)| index.index() as u32)
                .ok_or_else(|| BuildError::UnknownLocal(name.to_string())),
            LocalRef::Index(index) => Ok(index + bias),
        }
    }

    // ------------------------------------------------------------------
    // Constants
    // ------------------------------------------------------------------

    pub fn i32_const(&mut self, value: i32) -> crate::Result<usize> {
        let buf = self.stack.current_mut();
        let offset = buf.append_u8(Opcode::I32Const)?;
        buf.append_sleb(i64::from(value))?;
        Ok(offset)
    }

    /// `i64.const` for values that fit 52 bits, the widest integers the
    /// trace compiler produces.
    pub fn i52_const(&mut self, value: i64) -> crate::Result<usize> {
        debug_assert!((-(1i64 << 52)..(1i64 << 52)).contains(&value));
        let buf = self.stack.current_mut();
        let offset = buf.append_u8(Opcode::I64Const)?;
        buf.append_sleb(value)?;
        Ok(offset)
    }

    pub fn f32_const(&mut self, value: f32) -> crate::Result<usize> {
        let buf = self.stack.current_mut();
        let offset = buf.append_u8(Opcode::F32Const)?;
        buf.append_f32(value)?;
        Ok(offset)
    }

    pub fn f64_const(&mut self, value: f64) -> crate::Result<usize> {
        let buf = self.stack.current_mut();
        let offset = buf.append_u8(Opcode::F64Const)?;
        buf.append_f64(value)?;
        Ok(offset)
    }

    /// `i32.const` of `ip` rebased against the trace base address.
    pub fn ip_const(&mut self, ip: Ip) -> crate::Result<usize> {
        self.i32_const(ip.offset_from(self.base) as i32)
    }

    /// Emits a pointer constant, preferring a constant-slot `global.get`.
    ///
    /// A pointer already bound to a slot re-uses it; an unseen pointer
    /// claims the next free slot; with the table exhausted (or disabled)
    /// the pointer is inlined as `i32.const`.
    pub fn ptr_const(&mut self, ptr: HeapPtr) -> crate::Result<usize> {
        let known = self
            .constant_slots
            .iter()
            .find_map(|(slot, known)| (*known == ptr).then_some(slot));
        if let Some(slot) = known {
            return self.global_get(slot);
        }
        if self.constant_slots.len() < self.constant_slot_count {
            let slot = self.constant_slots.push(ptr);
            tracing::trace!("pointer {ptr} bound to constant slot {slot:?}");
            return self.global_get(slot);
        }
        self.i32_const(ptr.addr() as i32)
    }

    fn global_get(&mut self, slot: ConstantSlotIndex) -> crate::Result<usize> {
        let buf = self.stack.current_mut();
        let offset = buf.append_u8(Opcode::GlobalGet)?;
        buf.append_uleb(slot.index() as u64)?;
        Ok(offset)
    }

    // ------------------------------------------------------------------
    // Control structure and memory access
    // ------------------------------------------------------------------

    /// Opens a `block`, `loop` or `if`.
    pub fn block(&mut self, ty: BlockType, opcode: Opcode) -> crate::Result<usize> {
        debug_assert!(matches!(
            opcode,
            Opcode::Block | Opcode::Loop | Opcode::If
        ));
        self.active_blocks += 1;
        let buf = self.stack.current_mut();
        let offset = buf.append_u8(opcode)?;
        buf.append_u8(u32::from(ty.byte()))?;
        Ok(offset)
    }

    /// Closes the innermost open block.
    ///
    /// # Panics
    ///
    /// Panics if no block is open; that is a caller bug, not an input
    /// condition.
    pub fn end_block(&mut self) -> crate::Result<usize> {
        assert!(self.active_blocks > 0, "no open block to end");
        self.active_blocks -= 1;
        self.stack.current_mut().append_u8(Opcode::End)
    }

    /// Emits an address computation: base (local or constant) plus an
    /// immediate offset.
    pub fn lea<'a>(&mut self, base: impl Into<LeaBase<'a>>, offset: i32) -> crate::Result<usize> {
        let start = match base.into() {
            LeaBase::Local(name) => self.arg(name, Opcode::LocalGet)?,
            LeaBase::Address(addr) => self.i32_const(addr)?,
        };
        self.i32_const(offset)?;
        self.append_u8(Opcode::I32Add)?;
        Ok(start)
    }

    /// Appends a memarg immediate: alignment exponent, then offset.
    pub fn append_memarg(&mut self, offset: u64, align_log2: u32) -> crate::Result<usize> {
        let buf = self.stack.current_mut();
        let start = buf.append_uleb(u64::from(align_log2))?;
        buf.append_uleb(offset)?;
        Ok(start)
    }

    /// Emits the trace epilogue: the resume ip and a `return`.
    pub fn ret(&mut self, ip: Ip) -> crate::Result<usize> {
        let offset = self.ip_const(ip)?;
        self.append_u8(Opcode::Return)?;
        Ok(offset)
    }

    /// Emits a call to a declared import, assigning its index on first use.
    pub fn call_import(&mut self, name: &str) -> crate::Result<usize> {
        let index = self.imports.index_for_call(name)?;
        let buf = self.stack.current_mut();
        let offset = buf.append_u8(Opcode::Call)?;
        buf.append_uleb(index.index() as u64)?;
        Ok(offset)
    }

    /// Records the current body offset as a back-branch target for the
    /// interpreter-side dispatcher.
    pub fn mark_back_branch_target(&mut self) {
        self.back_branch_offsets.push(self.stack.size() as u32);
    }

    /// Back-branch targets recorded since `begin_function`.
    pub fn back_branch_targets(&self) -> &[u32] {
        &self.back_branch_offsets
    }

    // ------------------------------------------------------------------
    // Buffer passthroughs, targeting the current stack top
    // ------------------------------------------------------------------

    pub fn append_u8(&mut self, value: impl Into<u32>) -> crate::Result<usize> {
        self.stack.current_mut().append_u8(value)
    }

    pub fn append_u16(&mut self, value: u16) -> crate::Result<usize> {
        self.stack.current_mut().append_u16(value)
    }

    pub fn append_i16(&mut self, value: i16) -> crate::Result<usize> {
        self.stack.current_mut().append_i16(value)
    }

    pub fn append_u32(&mut self, value: u32) -> crate::Result<usize> {
        self.stack.current_mut().append_u32(value)
    }

    pub fn append_i32(&mut self, value: i32) -> crate::Result<usize> {
        self.stack.current_mut().append_i32(value)
    }

    pub fn append_f32(&mut self, value: f32) -> crate::Result<usize> {
        self.stack.current_mut().append_f32(value)
    }

    pub fn append_f64(&mut self, value: f64) -> crate::Result<usize> {
        self.stack.current_mut().append_f64(value)
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) -> crate::Result<usize> {
        self.stack.current_mut().append_bytes(bytes)
    }

    pub fn append_name(&mut self, text: &str) -> crate::Result<usize> {
        self.stack.current_mut().append_name(text)
    }

    pub fn append_uleb(&mut self, value: u64) -> crate::Result<usize> {
        self.stack.current_mut().append_uleb(value)
    }

    pub fn append_sleb(&mut self, value: i64) -> crate::Result<usize> {
        self.stack.current_mut().append_sleb(value)
    }

    pub fn append_boundary_value(&mut self, bits: u32, negative: bool) -> crate::Result<usize> {
        self.stack.current_mut().append_boundary_value(bits, negative)
    }

    // ------------------------------------------------------------------
    // Module assembly
    // ------------------------------------------------------------------

    /// Appends the 8-byte module preamble (magic + version) to the current
    /// buffer. Callers that hand the bytes straight to an instantiation
    /// API call this before emitting sections.
    pub fn append_module_header(&mut self) -> crate::Result<usize> {
        let buf = self.stack.current_mut();
        let offset = buf.append_u32(0x6D73_6100)?; // "\0asm"
        buf.append_u32(1)?;
        Ok(offset)
    }

    /// Runs every registered generator, captures the body blobs and writes
    /// the type, import, function, export and code sections.
    ///
    /// A failing generator leaves its partial body on the record for
    /// dumping and the error propagates, unless
    /// [`BuilderConfig::tolerate_generator_failures`] was set, in which
    /// case the error is recorded and emission continues.
    pub fn emit_imports_and_functions(&mut self) -> crate::Result<()> {
        let mut functions = mem::take(&mut self.functions);
        let keys: Vec<FuncIndex> = functions.keys().collect();
        for index in keys {
            let Some(generator) = functions[index].generator.take() else {
                continue;
            };
            let (type_name, locals) = {
                let record = &functions[index];
                tracing::trace!("generating body for `{}` ({index:?})", record.name);
                (record.type_name.clone(), record.locals.clone())
            };
            if let Err(error) = self.begin_function(&type_name, &locals) {
                self.functions = functions;
                return Err(error);
            }
            let result = generator(self).and_then(|()| self.end_function(false));
            match result {
                Ok(body) => functions[index].body = body,
                Err(error) => {
                    let record = &mut functions[index];
                    tracing::error!("generator for `{}` failed: {error}", record.name);
                    // Keep whatever was emitted so the caller can dump it.
                    self.active_blocks = 0;
                    if let Ok(partial) = self.stack.pop_bytes() {
                        record.body = Some(partial);
                    }
                    record.error = Some(error.clone());
                    if !self.tolerate_generator_failures {
                        self.functions = functions;
                        return Err(error);
                    }
                }
            }
        }
        self.functions = functions;

        self.generate_type_section()?;
        self.generate_import_section()?;
        self.generate_function_section()?;
        self.generate_export_section()?;
        self.generate_code_section()?;
        Ok(())
    }

    /// The assembled module bytes.
    pub fn module_bytes(&self) -> &[u8] {
        self.stack.base().bytes()
    }

    /// Registered functions, in definition order.
    pub fn functions(&self) -> impl Iterator<Item = (FuncIndex, &FunctionRecord)> {
        self.functions.iter()
    }

    pub fn import(&self, name: &str) -> Option<&ImportedFunction> {
        self.imports.get(name)
    }

    /// Number of imports that made it into the module.
    pub fn imported_function_count(&self) -> u32 {
        self.imports.assigned_count()
    }

    fn begin_section(&mut self, id: SectionId) -> crate::Result<()> {
        self.stack.current_mut().append_u8(id)?;
        self.stack.push();
        Ok(())
    }

    fn end_section(&mut self) -> crate::Result<()> {
        self.stack.pop_into_parent()?;
        Ok(())
    }

    fn generate_type_section(&mut self) -> crate::Result<()> {
        self.begin_section(SectionId::Type)?;
        self.stack
            .current_mut()
            .append_uleb(self.types.count() as u64)?;
        for shape in self.types.shapes() {
            let buf = self.stack.current_mut();
            buf.append_u8(0x60u32)?;
            buf.append_uleb(shape.params.len() as u64)?;
            for param in &shape.params {
                buf.append_u8(*param)?;
            }
            match shape.result {
                Some(result) => {
                    buf.append_uleb(1)?;
                    buf.append_u8(result)?;
                }
                None => {
                    buf.append_uleb(0)?;
                }
            }
        }
        self.end_section()
    }

    fn generate_import_section(&mut self) -> crate::Result<()> {
        self.begin_section(SectionId::Import)?;
        let assigned = u64::from(self.imports.assigned_count());
        let slots = self.constant_slot_count as u64;
        // Entry order is wired into the host: functions by ascending
        // index, then constant globals, then the memory.
        self.stack.current_mut().append_uleb(1 + assigned + slots)?;
        for import in self.imports.in_index_order() {
            let buf = self.stack.current_mut();
            buf.append_name(&import.module)?;
            buf.append_name(&import.field)?;
            buf.append_u8(0x00u32)?;
            buf.append_uleb(import.type_index.index() as u64)?;
        }
        for slot in 0..self.constant_slot_count {
            let name = base36(slot);
            let buf = self.stack.current_mut();
            buf.append_name("c")?;
            buf.append_name(&name)?;
            buf.append_u8(0x03u32)?;
            buf.append_u8(ValType::I32)?;
            buf.append_u8(0x00u32)?; // immutable
        }
        let buf = self.stack.current_mut();
        buf.append_name("m")?;
        buf.append_name("h")?;
        buf.append_u8(0x02u32)?;
        buf.append_u8(0x00u32)?; // min only
        buf.append_uleb(1)?; // one page; the host grows it
        self.end_section()
    }

    fn generate_function_section(&mut self) -> crate::Result<()> {
        self.begin_section(SectionId::Function)?;
        self.stack
            .current_mut()
            .append_uleb(self.functions.len() as u64)?;
        for (_, func) in self.functions.iter() {
            self.stack
                .current_mut()
                .append_uleb(func.type_index.index() as u64)?;
        }
        self.end_section()
    }

    fn generate_export_section(&mut self) -> crate::Result<()> {
        self.begin_section(SectionId::Export)?;
        let imported = u64::from(self.imports.assigned_count());
        let exported = self.functions.values().filter(|func| func.export).count();
        self.stack.current_mut().append_uleb(exported as u64)?;
        for (index, func) in self.functions.iter() {
            if !func.export {
                continue;
            }
            let buf = self.stack.current_mut();
            buf.append_name(&func.name)?;
            buf.append_u8(0x00u32)?;
            buf.append_uleb(imported + index.index() as u64)?;
        }
        self.end_section()
    }

    fn generate_code_section(&mut self) -> crate::Result<()> {
        self.begin_section(SectionId::Code)?;
        self.stack
            .current_mut()
            .append_uleb(self.functions.len() as u64)?;
        for (_, func) in self.functions.iter() {
            let body = func.body.as_deref().unwrap_or(&[]);
            let buf = self.stack.current_mut();
            buf.append_uleb(body.len() as u64)?;
            buf.append_bytes(body)?;
        }
        self.end_section()
    }
}

/// Lower-case base-36 rendering, used for constant-slot field names.
fn base36(value: usize) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    let mut value = value;
    while value > 0 {
        digits.push(DIGITS[value % 36]);
        value /= 36;
    }
    digits.iter().rev().map(|b| char::from(*b)).collect()
}
