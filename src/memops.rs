//! Peephole expansion of small memset/memmove operations.
//!
//! Fills and copies whose size is known and small are emitted as straight
//! runs of native stores (or load/store pairs) against the interpreter
//! frame, which beats a call or a bulk-memory instruction at these sizes.
//! Anything larger or unknown falls back to `memory.fill`/`memory.copy`
//! with the operands already on the stack.

use crate::builder::ModuleBuilder;
use crate::opcodes::{MiscOpcode, Opcode};

/// Sizes at or above this fall back to the bulk instruction.
pub const MAX_MEMSET_SIZE: i32 = 64;
pub const MAX_MEMMOVE_SIZE: i32 = 64;

/// Scratch local a stacked destination address is parked in.
pub const SCRATCH_LHS: &str = "math_lhs32";
/// Scratch local a stacked source address is parked in.
pub const SCRATCH_RHS: &str = "math_rhs32";
/// The interpreter frame pointer local; `local_offset` operands are
/// relative to it.
pub const FRAME_LOCAL: &str = "pLocals";

const SET_CHUNKS: [(i32, Opcode); 3] = [
    (4, Opcode::I32Store),
    (2, Opcode::I32Store16),
    (1, Opcode::I32Store8),
];

const MOVE_CHUNKS: [(i32, Opcode, Opcode); 4] = [
    (8, Opcode::I64Load, Opcode::I64Store),
    (4, Opcode::I32Load, Opcode::I32Store),
    (2, Opcode::I32Load16U, Opcode::I32Store16),
    (1, Opcode::I32Load8U, Opcode::I32Store8),
];

/// Tries to emit `count` bytes of fill as inline stores.
///
/// Returns `Ok(false)` when the size is too large for the inline form; the
/// caller then emits the bulk fallback. With `dest_on_stack` the
/// destination address is popped into [`SCRATCH_LHS`]; otherwise the
/// destination is [`FRAME_LOCAL`]` + local_offset`.
///
/// Only `value = 0` is semantically supported; other values are emitted
/// verbatim as the store operand.
pub fn try_memset_fast(
    builder: &mut ModuleBuilder,
    local_offset: i32,
    value: i32,
    count: i32,
    dest_on_stack: bool,
) -> crate::Result<bool> {
    if count <= 0 {
        if dest_on_stack {
            builder.append_u8(Opcode::Drop)?;
        }
        return Ok(true);
    }
    if count >= MAX_MEMSET_SIZE {
        return Ok(false);
    }

    let (local, base) = if dest_on_stack {
        builder.arg(SCRATCH_LHS, Opcode::LocalSet)?;
        (SCRATCH_LHS, 0)
    } else {
        (FRAME_LOCAL, local_offset)
    };

    let mut remaining = count;
    let mut cursor = 0;
    while remaining >= 8 {
        builder.arg(local, Opcode::LocalGet)?;
        builder.i52_const(i64::from(value))?;
        builder.append_u8(Opcode::I64Store)?;
        builder.append_memarg((base + cursor) as u64, 0)?;
        cursor += 8;
        remaining -= 8;
    }
    for (width, store) in SET_CHUNKS {
        if remaining >= width {
            builder.arg(local, Opcode::LocalGet)?;
            builder.i32_const(value)?;
            builder.append_u8(store)?;
            builder.append_memarg((base + cursor) as u64, 0)?;
            cursor += width;
            remaining -= width;
        }
    }
    debug_assert_eq!(remaining, 0);
    Ok(true)
}

/// Bulk fill for a destination already on the stack:
/// `i32.const value; i32.const count; memory.fill`.
pub fn append_memset_dest(
    builder: &mut ModuleBuilder,
    value: i32,
    count: i32,
) -> crate::Result<()> {
    builder.i32_const(value)?;
    builder.i32_const(count)?;
    builder.append_u8(Opcode::MiscPrefix)?;
    builder.append_uleb(u64::from(MiscOpcode::MemoryFill))?;
    builder.append_u8(0x00u32)?;
    Ok(())
}

/// Tries to emit `count` bytes of copy as inline load/store pairs.
///
/// With `addresses_on_stack` the operands are popped into the scratch
/// locals (source on top, then destination); otherwise both ranges are
/// relative to [`FRAME_LOCAL`].
pub fn try_memmove_fast(
    builder: &mut ModuleBuilder,
    dest_local_offset: i32,
    src_local_offset: i32,
    count: i32,
    addresses_on_stack: bool,
) -> crate::Result<bool> {
    if count <= 0 {
        if addresses_on_stack {
            builder.append_u8(Opcode::Drop)?;
            builder.append_u8(Opcode::Drop)?;
        }
        return Ok(true);
    }
    if count >= MAX_MEMMOVE_SIZE {
        return Ok(false);
    }

    let (dest, dest_base, src, src_base) = if addresses_on_stack {
        builder.arg(SCRATCH_RHS, Opcode::LocalSet)?;
        builder.arg(SCRATCH_LHS, Opcode::LocalSet)?;
        (SCRATCH_LHS, 0, SCRATCH_RHS, 0)
    } else {
        (FRAME_LOCAL, dest_local_offset, FRAME_LOCAL, src_local_offset)
    };

    let mut remaining = count;
    let mut cursor = 0;
    for (width, load, store) in MOVE_CHUNKS {
        while remaining >= width {
            builder.arg(dest, Opcode::LocalGet)?;
            builder.arg(src, Opcode::LocalGet)?;
            builder.append_u8(load)?;
            builder.append_memarg((src_base + cursor) as u64, 0)?;
            builder.append_u8(store)?;
            builder.append_memarg((dest_base + cursor) as u64, 0)?;
            cursor += width;
            remaining -= width;
        }
    }
    debug_assert_eq!(remaining, 0);
    Ok(true)
}

/// Bulk copy for `dest, src` already on the stack:
/// `i32.const count; memory.copy`.
pub fn append_memmove_dest_src(builder: &mut ModuleBuilder, count: i32) -> crate::Result<()> {
    builder.i32_const(count)?;
    builder.append_u8(Opcode::MiscPrefix)?;
    builder.append_uleb(u64::from(MiscOpcode::MemoryCopy))?;
    builder.append_u8(0x00u32)?;
    builder.append_u8(0x00u32)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::ValType;

    fn trace_builder() -> ModuleBuilder {
        let mut builder = ModuleBuilder::default();
        builder
            .define_type("trace", &[("pLocals", ValType::I32)], None, false)
            .unwrap();
        builder
            .begin_function(
                "trace",
                &[("math_lhs32", ValType::I32), ("math_rhs32", ValType::I32)],
            )
            .unwrap();
        builder
    }

    #[test]
    fn memset_covers_exactly_count_bytes() {
        let mut builder = trace_builder();
        assert!(try_memset_fast(&mut builder, 16, 0, 13, false).unwrap());
        let body = builder.end_function(false).unwrap().unwrap();
        // Prologue (1 i32 group of 2), then stores: i64 at 16, i32 at 24,
        // i32.store8 at 28. Memargs are (align, offset).
        let expected = [
            0x01, 0x02, 0x7F, // locals
            0x20, 0x00, 0x42, 0x00, 0x37, 0x00, 0x10, // i64.store @16
            0x20, 0x00, 0x41, 0x00, 0x36, 0x00, 0x18, // i32.store @24
            0x20, 0x00, 0x41, 0x00, 0x3A, 0x00, 0x1C, // i32.store8 @28
        ];
        assert_eq!(body, expected);
    }

    #[test]
    fn memset_zero_count_drops_a_stacked_destination() {
        let mut builder = trace_builder();
        assert!(try_memset_fast(&mut builder, 0, 0, 0, true).unwrap());
        let body = builder.end_function(false).unwrap().unwrap();
        assert_eq!(body[3..], [Opcode::Drop as u8]);
    }

    #[test]
    fn large_memset_declines() {
        let mut builder = trace_builder();
        assert!(!try_memset_fast(&mut builder, 0, 0, MAX_MEMSET_SIZE, false).unwrap());
        // Nothing was emitted past the prologue.
        let body = builder.end_function(false).unwrap().unwrap();
        assert_eq!(body.len(), 3);
    }

    #[test]
    fn memmove_pairs_loads_with_stores() {
        let mut builder = trace_builder();
        assert!(try_memmove_fast(&mut builder, 0, 32, 10, false).unwrap());
        let body = builder.end_function(false).unwrap().unwrap();
        let expected = [
            0x01, 0x02, 0x7F, // locals
            0x20, 0x00, 0x20, 0x00, // dest, src
            0x29, 0x00, 0x20, // i64.load @32
            0x37, 0x00, 0x00, // i64.store @0
            0x20, 0x00, 0x20, 0x00, // dest, src
            0x2F, 0x00, 0x28, // i32.load16_u @40
            0x3B, 0x00, 0x08, // i32.store16 @8
        ];
        assert_eq!(body, expected);
    }

    #[test]
    fn stacked_memmove_parks_both_addresses() {
        let mut builder = trace_builder();
        assert!(try_memmove_fast(&mut builder, 0, 0, 1, true).unwrap());
        let body = builder.end_function(false).unwrap().unwrap();
        // set rhs (src), set lhs (dest), then one byte copied.
        let expected = [
            0x01, 0x02, 0x7F, // locals
            0x21, 0x02, 0x21, 0x01, // park src, dest
            0x20, 0x01, 0x20, 0x02, // dest, src
            0x2D, 0x00, 0x00, // i32.load8_u @0
            0x3A, 0x00, 0x00, // i32.store8 @0
        ];
        assert_eq!(body, expected);
    }

    #[test]
    fn bulk_fallbacks_use_the_misc_prefix() {
        let mut builder = trace_builder();
        append_memset_dest(&mut builder, 0, 200).unwrap();
        append_memmove_dest_src(&mut builder, 300).unwrap();
        let body = builder.end_function(false).unwrap().unwrap();
        let expected = [
            0x01, 0x02, 0x7F, // locals
            0x41, 0x00, 0x41, 0xC8, 0x01, 0xFC, 0x0B, 0x00, // memory.fill
            0x41, 0xAC, 0x02, 0xFC, 0x0A, 0x00, 0x00, // memory.copy
        ];
        assert_eq!(body, expected);
    }
}
