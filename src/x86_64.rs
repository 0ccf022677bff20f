//! x86-64 instruction encoding.
//!
//! Encodes the instruction subset the emitter needs as raw bytes into a
//! [`CodeBuffer`], following the System V AMD64 ABI. Branches take
//! [`Label`]s; their rel32 displacements are patched when the buffer is
//! resolved.

use super::codebuf::{CodeBuffer, Label};

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,  // Return value
    Rcx = 1,  // 4th argument
    Rdx = 2,  // 3rd argument
    Rbx = 3,  // Callee-saved
    Rsp = 4,  // Stack pointer
    Rbp = 5,  // Frame pointer (callee-saved)
    Rsi = 6,  // 2nd argument
    Rdi = 7,  // 1st argument
    R8 = 8,   // 5th argument
    R9 = 9,   // 6th argument
    R10 = 10, // Caller-saved
    R11 = 11, // Caller-saved
    R12 = 12, // Callee-saved
    R13 = 13, // Callee-saved
    R14 = 14, // Callee-saved
    R15 = 15, // Callee-saved
}

impl Reg {
    /// Get the register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Check if this register requires REX.B or REX.R extension.
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    /// Get the REX.B bit for this register (when used as base/rm).
    pub fn rex_b(self) -> u8 {
        if self.needs_rex_ext() { 0x01 } else { 0x00 }
    }

    /// Get the REX.R bit for this register (when used as reg).
    pub fn rex_r(self) -> u8 {
        if self.needs_rex_ext() { 0x04 } else { 0x00 }
    }
}

/// SSE registers used for double arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
}

impl Xmm {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// x86-64 condition codes (for Jcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    B = 0x2,  // Below (unsigned <)
    Ae = 0x3, // Above or equal (unsigned >=)
    E = 0x4,  // Equal
    Ne = 0x5, // Not equal
    Be = 0x6, // Below or equal (unsigned <=)
    A = 0x7,  // Above (unsigned >)
}

/// x86-64 assembler.
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    // ==================== Encoding helpers ====================

    /// Emit REX.W prefix for 64-bit operations.
    fn emit_rex_w(&mut self, reg: Reg, rm: Reg) {
        let rex = 0x48 | reg.rex_r() | rm.rex_b();
        self.buf.emit_u8(rex);
    }

    /// Emit REX.W prefix for single register operations.
    fn emit_rex_w_single(&mut self, rm: Reg) {
        let rex = 0x48 | rm.rex_b();
        self.buf.emit_u8(rex);
    }

    /// Encode ModR/M byte.
    /// mod: 2 bits, reg: 3 bits, rm: 3 bits
    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// Emit the ModR/M (and SIB/displacement) bytes for a `[base + disp]`
    /// memory operand with `reg_field` in the reg position.
    ///
    /// RSP/R12 as base always need a SIB byte; RBP/R13 as base cannot use
    /// the no-displacement form.
    fn emit_mem(&mut self, reg_field: u8, base: Reg, disp: i32) {
        let needs_sib = base == Reg::Rsp || base == Reg::R12;
        let no_disp = disp == 0 && base != Reg::Rbp && base != Reg::R13;
        let (mode, imm8) = if no_disp {
            (0b00, false)
        } else if (-128..=127).contains(&disp) {
            (0b01, true)
        } else {
            (0b10, false)
        };

        if needs_sib {
            self.buf.emit_u8(Self::modrm(mode, reg_field, 0b100));
            self.buf.emit_u8(0x24); // SIB: scale=1, no index, base=base
        } else {
            self.buf.emit_u8(Self::modrm(mode, reg_field, base.code()));
        }

        if no_disp {
            // nothing
        } else if imm8 {
            self.buf.emit_u8(disp as u8);
        } else {
            self.buf.emit_u32(disp as u32);
        }
    }

    // ==================== Data Movement ====================

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x89); // MOV r/m64, r64
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r64, imm64 (movabs)
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.emit_rex_w_single(dst);
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm as u64);
    }

    /// MOV r64, imm32 (sign-extended)
    pub fn mov_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_rex_w_single(dst);
        self.buf.emit_u8(0xC7); // MOV r/m64, imm32
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
        self.buf.emit_u32(imm as u32);
    }

    /// MOV r64, [base + disp32]
    pub fn mov_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit_rex_w(dst, base);
        self.buf.emit_u8(0x8B); // MOV r64, r/m64
        self.emit_mem(dst.code(), base, disp);
    }

    /// MOV [base + disp32], r64
    pub fn mov_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        self.emit_rex_w(src, base);
        self.buf.emit_u8(0x89); // MOV r/m64, r64
        self.emit_mem(src.code(), base, disp);
    }

    /// MOV DWORD PTR [base + disp32], imm32 (32-bit store)
    pub fn mov_mi32(&mut self, base: Reg, disp: i32, imm: i32) {
        if base.needs_rex_ext() {
            self.buf.emit_u8(0x40 | base.rex_b());
        }
        self.buf.emit_u8(0xC7); // MOV r/m32, imm32
        self.emit_mem(0, base, disp);
        self.buf.emit_u32(imm as u32);
    }

    /// LEA r64, [base + disp32]
    pub fn lea(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit_rex_w(dst, base);
        self.buf.emit_u8(0x8D); // LEA r64, m
        self.emit_mem(dst.code(), base, disp);
    }

    // ==================== Arithmetic / flags ====================

    /// ADD r64, imm32 (sign-extended)
    pub fn add_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_rex_w_single(dst);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83); // ADD r/m64, imm8
            self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81); // ADD r/m64, imm32
            self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// SUB r64, imm32 (sign-extended)
    pub fn sub_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_rex_w_single(dst);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83); // SUB r/m64, imm8
            self.buf.emit_u8(Self::modrm(0b11, 5, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81); // SUB r/m64, imm32
            self.buf.emit_u8(Self::modrm(0b11, 5, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// CMP r64, r64
    pub fn cmp_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x39); // CMP r/m64, r64
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// TEST r64, r64
    pub fn test_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x85); // TEST r/m64, r64
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOVZX r64, r8 (zero-extend the low byte; normalizes a bool return)
    pub fn movzx_r64_r8(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(dst, src);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB6); // MOVZX r64, r/m8
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    // ==================== Stack ====================

    /// PUSH r64
    pub fn push(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    /// POP r64
    pub fn pop(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    // ==================== Control Flow ====================

    /// JMP label (near, rel32)
    pub fn jmp(&mut self, label: Label) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_label_rel32(label);
    }

    /// Jcc label (near, rel32)
    pub fn jcc(&mut self, cond: Cond, label: Label) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        self.buf.emit_label_rel32(label);
    }

    /// CALL r64 (indirect)
    pub fn call_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0xFF); // CALL r/m64
        self.buf.emit_u8(Self::modrm(0b11, 2, reg.code()));
    }

    /// RET
    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    // ==================== SSE2 doubles ====================

    /// MOVQ xmm, r64
    pub fn movq_xmm_r64(&mut self, dst: Xmm, src: Reg) {
        // 66 REX.W 0F 6E /r
        self.buf.emit_u8(0x66);
        self.buf.emit_u8(0x48 | src.rex_b());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x6E);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// MOVQ r64, xmm
    pub fn movq_r64_xmm(&mut self, dst: Reg, src: Xmm) {
        // 66 REX.W 0F 7E /r
        self.buf.emit_u8(0x66);
        self.buf.emit_u8(0x48 | dst.rex_b());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x7E);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// ADDSD xmm1, xmm2
    pub fn addsd(&mut self, dst: Xmm, src: Xmm) {
        // F2 0F 58 /r
        self.buf.emit_u8(0xF2);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x58);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// MULSD xmm1, xmm2
    pub fn mulsd(&mut self, dst: Xmm, src: Xmm) {
        // F2 0F 59 /r
        self.buf.emit_u8(0xF2);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x59);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// UCOMISD xmm1, xmm2 (unordered compare, sets CF/ZF/PF)
    pub fn ucomisd(&mut self, lhs: Xmm, rhs: Xmm) {
        // 66 0F 2E /r
        self.buf.emit_u8(0x66);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x2E);
        self.buf.emit_u8(Self::modrm(0b11, lhs.code(), rhs.code()));
    }

    /// CVTSI2SD xmm, r64
    pub fn cvtsi2sd(&mut self, dst: Xmm, src: Reg) {
        // F2 REX.W 0F 2A /r
        self.buf.emit_u8(0xF2);
        self.buf.emit_u8(0x48 | src.rex_b());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x2A);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(f: impl FnOnce(&mut X86_64Assembler)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        f(&mut asm);
        buf.resolve().unwrap()
    }

    #[test]
    fn mov_rr() {
        // MOV RAX, RBX = 48 89 D8
        assert_eq!(emit(|a| a.mov_rr(Reg::Rax, Reg::Rbx)), [0x48, 0x89, 0xD8]);
        // MOV R9, R8 = 4D 89 C1
        assert_eq!(emit(|a| a.mov_rr(Reg::R9, Reg::R8)), [0x4D, 0x89, 0xC1]);
    }

    #[test]
    fn mov_ri64() {
        // MOV R15, 42 = 49 BF 2A 00 ...
        assert_eq!(
            emit(|a| a.mov_ri64(Reg::R15, 42)),
            [0x49, 0xBF, 0x2A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn mov_rm_forms() {
        // MOV RAX, [RBX] = 48 8B 03
        assert_eq!(emit(|a| a.mov_rm(Reg::Rax, Reg::Rbx, 0)), [0x48, 0x8B, 0x03]);
        // MOV RAX, [RBX+16] = 48 8B 43 10
        assert_eq!(
            emit(|a| a.mov_rm(Reg::Rax, Reg::Rbx, 16)),
            [0x48, 0x8B, 0x43, 0x10]
        );
        // MOV RAX, [RSP+8] needs a SIB byte = 48 8B 44 24 08
        assert_eq!(
            emit(|a| a.mov_rm(Reg::Rax, Reg::Rsp, 8)),
            [0x48, 0x8B, 0x44, 0x24, 0x08]
        );
        // MOV RAX, [R12] also needs SIB = 49 8B 04 24
        assert_eq!(
            emit(|a| a.mov_rm(Reg::Rax, Reg::R12, 0)),
            [0x49, 0x8B, 0x04, 0x24]
        );
        // MOV RAX, [RBP] cannot use the no-disp form = 48 8B 45 00
        assert_eq!(emit(|a| a.mov_rm(Reg::Rax, Reg::Rbp, 0)), [0x48, 0x8B, 0x45, 0x00]);
    }

    #[test]
    fn mov_mr_store() {
        // MOV [RBX+8], RAX = 48 89 43 08
        assert_eq!(
            emit(|a| a.mov_mr(Reg::Rbx, 8, Reg::Rax)),
            [0x48, 0x89, 0x43, 0x08]
        );
    }

    #[test]
    fn mov_mi32_store() {
        // MOV DWORD PTR [RSP+8], 0 = C7 44 24 08 00 00 00 00
        assert_eq!(
            emit(|a| a.mov_mi32(Reg::Rsp, 8, 0)),
            [0xC7, 0x44, 0x24, 0x08, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn lea_operand_address() {
        // LEA RSI, [RBX+24] = 48 8D 73 18
        assert_eq!(emit(|a| a.lea(Reg::Rsi, Reg::Rbx, 24)), [0x48, 0x8D, 0x73, 0x18]);
        // LEA RSI, [RBX] = 48 8D 33
        assert_eq!(emit(|a| a.lea(Reg::Rsi, Reg::Rbx, 0)), [0x48, 0x8D, 0x33]);
    }

    #[test]
    fn stack_adjust() {
        // SUB RSP, 32 = 48 83 EC 20
        assert_eq!(emit(|a| a.sub_ri32(Reg::Rsp, 32)), [0x48, 0x83, 0xEC, 0x20]);
        // ADD RSP, 256 = 48 81 C4 00 01 00 00
        assert_eq!(
            emit(|a| a.add_ri32(Reg::Rsp, 256)),
            [0x48, 0x81, 0xC4, 0x00, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn cmp_and_test() {
        // CMP RAX, R15 = 4C 39 F8
        assert_eq!(emit(|a| a.cmp_rr(Reg::Rax, Reg::R15)), [0x4C, 0x39, 0xF8]);
        // TEST RAX, RAX = 48 85 C0
        assert_eq!(emit(|a| a.test_rr(Reg::Rax, Reg::Rax)), [0x48, 0x85, 0xC0]);
    }

    #[test]
    fn push_pop() {
        // PUSH RBX; PUSH R12; POP R12; POP RBX
        assert_eq!(
            emit(|a| {
                a.push(Reg::Rbx);
                a.push(Reg::R12);
                a.pop(Reg::R12);
                a.pop(Reg::Rbx);
            }),
            [0x53, 0x41, 0x54, 0x41, 0x5C, 0x5B]
        );
    }

    #[test]
    fn call_indirect() {
        // CALL RAX = FF D0
        assert_eq!(emit(|a| a.call_r(Reg::Rax)), [0xFF, 0xD0]);
        // CALL R12 = 41 FF D4
        assert_eq!(emit(|a| a.call_r(Reg::R12)), [0x41, 0xFF, 0xD4]);
    }

    #[test]
    fn branch_to_label() {
        let mut buf = CodeBuffer::new();
        let target = buf.new_label("L");
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.jcc(Cond::Ae, target);
        asm.ret();
        buf.bind(target);

        let code = buf.resolve().unwrap();
        // JAE rel32 = 0F 83, displacement +1 (over the RET)
        assert_eq!(&code[..2], &[0x0F, 0x83]);
        assert_eq!(&code[2..6], &1i32.to_le_bytes());
        assert_eq!(code[6], 0xC3);
    }

    #[test]
    fn sse_moves_and_arith() {
        // MOVQ XMM0, RAX = 66 48 0F 6E C0
        assert_eq!(
            emit(|a| a.movq_xmm_r64(Xmm::Xmm0, Reg::Rax)),
            [0x66, 0x48, 0x0F, 0x6E, 0xC0]
        );
        // MOVQ RAX, XMM0 = 66 48 0F 7E C0
        assert_eq!(
            emit(|a| a.movq_r64_xmm(Reg::Rax, Xmm::Xmm0)),
            [0x66, 0x48, 0x0F, 0x7E, 0xC0]
        );
        // MULSD XMM0, XMM1 = F2 0F 59 C1
        assert_eq!(
            emit(|a| a.mulsd(Xmm::Xmm0, Xmm::Xmm1)),
            [0xF2, 0x0F, 0x59, 0xC1]
        );
        // ADDSD XMM0, XMM1 = F2 0F 58 C1
        assert_eq!(
            emit(|a| a.addsd(Xmm::Xmm0, Xmm::Xmm1)),
            [0xF2, 0x0F, 0x58, 0xC1]
        );
        // UCOMISD XMM0, XMM1 = 66 0F 2E C1
        assert_eq!(
            emit(|a| a.ucomisd(Xmm::Xmm0, Xmm::Xmm1)),
            [0x66, 0x0F, 0x2E, 0xC1]
        );
        // CVTSI2SD XMM0, RAX = F2 48 0F 2A C0
        assert_eq!(
            emit(|a| a.cvtsi2sd(Xmm::Xmm0, Reg::Rax)),
            [0xF2, 0x48, 0x0F, 0x2A, 0xC0]
        );
    }
}
