//! Raw byte encoders for the specific instructions we inject. Deliberately
//! narrow: this is not a general encoder, just the mnemonics §4.1-§4.3 need.

use crate::decode::Reg;
use crate::emit::Emitted;

fn rex(w: bool, r: bool, x: bool, b: bool) -> Option<u8> {
    if !(w || r || x || b) {
        return None;
    }
    Some(0x40 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8))
}

fn push_rex_if_needed(bytes: &mut Vec<u8>, w: bool, r: bool, x: bool, b: bool) {
    if let Some(byte) = rex(w, r, x, b) {
        bytes.push(byte);
    }
}

fn width_prefixes(bytes: &mut Vec<u8>, width_bits: u16) -> bool {
    // Returns whether REX.W is required; pushes the 0x66 operand-size
    // override for 16-bit operands.
    match width_bits {
        16 => {
            bytes.push(0x66);
            false
        }
        64 => true,
        _ => false,
    }
}

/// Canonical multi-byte NOP, per the Intel-recommended sequences. Used for
/// the 7-byte block-coverage recorder clear (§4.1) and the I2S on/off switch
/// (§4.3, 5-byte form).
pub fn nop(len: usize) -> Emitted {
    let bytes: &[u8] = match len {
        1 => &[0x90],
        2 => &[0x66, 0x90],
        3 => &[0x0F, 0x1F, 0x00],
        4 => &[0x0F, 0x1F, 0x40, 0x00],
        5 => &[0x0F, 0x1F, 0x44, 0x00, 0x00],
        6 => &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
        7 => &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
        8 => &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        9 => &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        _ => panic!("no canonical NOP encoding of length {len}"),
    };
    Emitted::plain(bytes.to_vec())
}

/// `JMP rel32`: 5 bytes, `E9 <disp32>`. `disp` is relative to the address of
/// the byte *after* this instruction.
pub fn jmp_rel32(disp: i32) -> Emitted {
    let mut bytes = vec![0xE9];
    bytes.extend_from_slice(&disp.to_le_bytes());
    Emitted::plain(bytes)
}

/// `Jcc rel32`: 6 bytes, `0F 8x <disp32>`.
pub fn jcc_rel32(condition: JccCondition, disp: i32) -> Emitted {
    let mut bytes = vec![0x0F, condition.opcode_byte()];
    bytes.extend_from_slice(&disp.to_le_bytes());
    Emitted::plain(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JccCondition {
    /// `JB`/`JC`/`JNAE` -- used to skip the compare-coverage recorder when
    /// fewer than `match_width` leading bits matched (§4.2 step 8).
    Below,
}

impl JccCondition {
    fn opcode_byte(self) -> u8 {
        match self {
            JccCondition::Below => 0x82,
        }
    }
}

/// `PUSH r64`.
pub fn push_reg(reg: Reg) -> Emitted {
    let mut bytes = Vec::new();
    push_rex_if_needed(&mut bytes, false, false, false, reg.needs_rex_extension());
    bytes.push(0x50 + reg.low_bits());
    Emitted::plain(bytes)
}

/// `POP r64`.
pub fn pop_reg(reg: Reg) -> Emitted {
    let mut bytes = Vec::new();
    push_rex_if_needed(&mut bytes, false, false, false, reg.needs_rex_extension());
    bytes.push(0x58 + reg.low_bits());
    Emitted::plain(bytes)
}

/// `PUSHF` / `POPF` (`RFLAGS` push/pop). No REX needed.
pub fn pushf() -> Emitted {
    Emitted::plain(vec![0x9C])
}

pub fn popf() -> Emitted {
    Emitted::plain(vec![0x9D])
}

fn modrm(mode: u8, reg_field: u8, rm_field: u8) -> u8 {
    (mode << 6) | ((reg_field & 0x7) << 3) | (rm_field & 0x7)
}

/// `LZCNT dst, dst` (leading-zero count, §4.2 step 6): `F3 [REX] 0F BD /r`.
pub fn lzcnt_reg_reg(dst: Reg, src: Reg, width_bits: u16) -> Emitted {
    let mut bytes = vec![0xF3];
    let w = width_prefixes(&mut bytes, width_bits);
    push_rex_if_needed(
        &mut bytes,
        w,
        dst.needs_rex_extension(),
        false,
        src.needs_rex_extension(),
    );
    bytes.push(0x0F);
    bytes.push(0xBD);
    bytes.push(modrm(0b11, dst.low_bits(), src.low_bits()));
    Emitted::plain(bytes)
}

/// `CMP dst, imm8` (sign-extended), §4.2 step 7. The returned `patch_offset`
/// points at the trailing `imm8` byte -- the **mutable match-width byte**.
pub fn cmp_reg_imm8(dst: Reg, imm8: u8, width_bits: u16) -> Emitted {
    let mut bytes = Vec::new();
    let w = width_prefixes(&mut bytes, width_bits);
    push_rex_if_needed(&mut bytes, w, false, false, dst.needs_rex_extension());
    bytes.push(0x83);
    bytes.push(modrm(0b11, 0x7, dst.low_bits()));
    let patch_offset = bytes.len();
    bytes.push(imm8);
    Emitted::with_patch(bytes, patch_offset)
}

/// `XOR dst, src` (register form), §4.2 step 5.
pub fn xor_reg_reg(dst: Reg, src: Reg, width_bits: u16) -> Emitted {
    let mut bytes = Vec::new();
    let w = width_prefixes(&mut bytes, width_bits);
    push_rex_if_needed(
        &mut bytes,
        w,
        src.needs_rex_extension(),
        false,
        dst.needs_rex_extension(),
    );
    // 0x31 /r: XOR r/m, r -- src is the "reg" field, dst is the "rm" field.
    bytes.push(0x31);
    bytes.push(modrm(0b11, src.low_bits(), dst.low_bits()));
    Emitted::plain(bytes)
}

/// `XOR dst, [rip+disp]`, used when operand2 of the compare is memory.
pub fn xor_reg_rip_mem(dst: Reg, width_bits: u16, disp: i32) -> Emitted {
    let mut bytes = Vec::new();
    let w = width_prefixes(&mut bytes, width_bits);
    push_rex_if_needed(&mut bytes, w, dst.needs_rex_extension(), false, false);
    bytes.push(0x33);
    bytes.push(modrm(0b00, dst.low_bits(), 0b101)); // mod=00, rm=101 => RIP-relative
    bytes.extend_from_slice(&disp.to_le_bytes());
    Emitted::plain(bytes)
}

/// `XOR dst, imm32` (sign-extended), used when operand2 of the compare is an
/// immediate.
pub fn xor_reg_imm32(dst: Reg, width_bits: u16, imm32: i32) -> Emitted {
    let mut bytes = Vec::new();
    let w = width_prefixes(&mut bytes, width_bits);
    push_rex_if_needed(&mut bytes, w, false, false, dst.needs_rex_extension());
    bytes.push(0x81);
    bytes.push(modrm(0b11, 0x6, dst.low_bits()));
    bytes.extend_from_slice(&imm32.to_le_bytes());
    Emitted::plain(bytes)
}

/// `MOV dst, [rip+disp]`, used to materialize a memory operand1 into
/// `dst_reg` before `XOR`-ing it against operand2 (§4.2 step 4 / §4.3 step 5).
pub fn mov_reg_rip_mem(dst: Reg, width_bits: u16, disp: i32) -> Emitted {
    let mut bytes = Vec::new();
    let w = width_prefixes(&mut bytes, width_bits);
    push_rex_if_needed(&mut bytes, w, dst.needs_rex_extension(), false, false);
    bytes.push(0x8B);
    bytes.push(modrm(0b00, dst.low_bits(), 0b101));
    bytes.extend_from_slice(&disp.to_le_bytes());
    Emitted::plain(bytes)
}

/// `MOV dst, src` register form.
pub fn mov_reg_reg(dst: Reg, src: Reg, width_bits: u16) -> Emitted {
    let mut bytes = Vec::new();
    let w = width_prefixes(&mut bytes, width_bits);
    push_rex_if_needed(
        &mut bytes,
        w,
        src.needs_rex_extension(),
        false,
        dst.needs_rex_extension(),
    );
    bytes.push(0x8B);
    bytes.push(modrm(0b11, src.low_bits(), dst.low_bits()));
    Emitted::plain(bytes)
}

/// `MOV dst, imm32` (zero/sign-extended per width), used when operand2 of
/// the compare is an immediate and I2S needs it materialized into a register.
pub fn mov_reg_imm32(dst: Reg, width_bits: u16, imm32: i32) -> Emitted {
    let mut bytes = Vec::new();
    let w = width_prefixes(&mut bytes, width_bits);
    push_rex_if_needed(&mut bytes, w, false, false, dst.needs_rex_extension());
    bytes.push(0xC7);
    bytes.push(modrm(0b11, 0, dst.low_bits()));
    bytes.extend_from_slice(&imm32.to_le_bytes());
    Emitted::plain(bytes)
}

/// `MOV [rip+disp], src`, used to write an I2S operand slot (§4.3 steps 5-6).
pub fn mov_rip_mem_reg(src: Reg, width_bits: u16, disp: i32) -> Emitted {
    let mut bytes = Vec::new();
    let w = width_prefixes(&mut bytes, width_bits);
    push_rex_if_needed(&mut bytes, w, src.needs_rex_extension(), false, false);
    bytes.push(0x89);
    bytes.push(modrm(0b00, src.low_bits(), 0b101));
    bytes.extend_from_slice(&disp.to_le_bytes());
    Emitted::plain(bytes)
}

/// Single-byte store of the immediate `1` to `[rip+disp]` (§4.1, "Recorder").
/// 7 bytes total: `C6 05 <disp32> <imm8>`. Flags-free, register-free.
pub fn store_byte_one_rip(disp: i32) -> Emitted {
    let mut bytes = vec![0xC6, 0x05];
    bytes.extend_from_slice(&disp.to_le_bytes());
    bytes.push(0x01);
    debug_assert_eq!(bytes.len(), 7, "block recorder must be exactly 7 bytes");
    Emitted::plain(bytes)
}

/// 4-byte store of the immediate `1` to `[rip+disp]` (§4.3 step 4, the I2S
/// "hit" marker): `C7 05 <disp32> <imm32>`.
pub fn store_dword_one_rip(disp: i32) -> Emitted {
    let mut bytes = vec![0xC7, 0x05];
    bytes.extend_from_slice(&disp.to_le_bytes());
    bytes.extend_from_slice(&1i32.to_le_bytes());
    Emitted::plain(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_recorder_is_seven_bytes_and_flag_free() {
        let emitted = store_byte_one_rip(0x1234);
        assert_eq!(emitted.bytes.len(), 7);
        assert_eq!(&emitted.bytes[0..2], &[0xC6, 0x05]);
        assert_eq!(emitted.bytes[6], 0x01);
    }

    #[test]
    fn five_byte_nop_and_jmp_are_interchangeable_sizes() {
        assert_eq!(nop(5).len(), 5);
        assert_eq!(jmp_rel32(0).len(), 5);
    }

    #[test]
    fn cmp_imm8_patch_offset_points_at_final_byte() {
        let emitted = cmp_reg_imm8(Reg::Rax, 24, 32);
        let offset = emitted.patch_offset.unwrap();
        assert_eq!(offset, emitted.bytes.len() - 1);
        assert_eq!(emitted.bytes[offset], 24);
    }

    #[test]
    fn extended_registers_get_a_rex_prefix() {
        let with_r8 = push_reg(Reg::R8);
        assert_eq!(with_r8.bytes[0] & 0xF0, 0x40);
        let with_rax = push_reg(Reg::Rax);
        assert_eq!(with_rax.bytes.len(), 1);
    }
}
