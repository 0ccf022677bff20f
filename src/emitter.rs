//! Template emitter for compiled functions.
//!
//! Each operation compiler appends the inline numeric fast path immediately
//! and defers the general path as a [`SlowPathTask`]. `finalize` drains the
//! task queue in enqueue order, so the finished stream is all fast paths
//! first, then all slow paths in compile order — the hot path stays
//! contiguous in the instruction cache.
//!
//! Register conventions (System V AMD64):
//! - `r12`: execution-context handle (callee-saved)
//! - `rbx`: frame base (callee-saved)
//! - `r15`: tag boundary, loaded once per function (callee-saved)
//! - `r14`: return-value stash across the frame-leave call (callee-saved)
//! - `rax`/`rcx` and `xmm0`/`xmm1`: scratch

use std::collections::VecDeque;

use serde::Serialize;

use crate::codebuf::{CodeBuffer, Label};
use crate::memory::ExecutableMemory;
use crate::runtime::{ExecContext, JitEntry, RootFrame, Service};
use crate::value::{TAG_BOUNDARY, TaggedValue};
use crate::x86_64::{Cond, Reg, X86_64Assembler, Xmm};

/// Register assignments for compiled code.
mod regs {
    use crate::x86_64::Reg;

    pub const CTX: Reg = Reg::R12;
    pub const FRAME: Reg = Reg::Rbx;
    pub const TAG_LIMIT: Reg = Reg::R15;
    pub const RET_STASH: Reg = Reg::R14;
}

/// Width of one frame slot.
const SLOT_SIZE: i32 = 8;

/// Native stack bytes reserved below the saved registers for the GC
/// root-list header.
const ROOT_HEADER_SIZE: i32 = 16;

/// Binary operations with an inline double fast path.
#[derive(Debug, Clone, Copy)]
enum BinaryOp {
    Mul,
}

impl BinaryOp {
    fn name(self) -> &'static str {
        match self {
            BinaryOp::Mul => "mul",
        }
    }

    fn service(self) -> Service {
        match self {
            BinaryOp::Mul => Service::Mul,
        }
    }
}

/// Unary operations; the fast path adds a fixed immediate.
#[derive(Debug, Clone, Copy)]
enum UnaryOp {
    Inc,
    Dec,
}

impl UnaryOp {
    fn name(self) -> &'static str {
        match self {
            UnaryOp::Inc => "inc",
            UnaryOp::Dec => "dec",
        }
    }

    fn service(self) -> Service {
        match self {
            UnaryOp::Inc => Service::Inc,
            UnaryOp::Dec => Service::Dec,
        }
    }

    fn addend(self) -> f64 {
        match self {
            UnaryOp::Inc => 1.0,
            UnaryOp::Dec => -1.0,
        }
    }
}

/// A deferred unit of code generation for one operation's general path.
///
/// Plain records rather than closures: the queue owns each task until it
/// drains it, and everything a task needs is these few operand indices and
/// labels.
#[derive(Debug)]
enum SlowPathTask {
    Binary {
        op: BinaryOp,
        dest: u32,
        lhs: u32,
        rhs: u32,
        slow: Label,
        cont: Label,
    },
    Unary {
        op: UnaryOp,
        dest: u32,
        src: u32,
        slow: Label,
        cont: Label,
    },
    CompareBranch {
        invert: bool,
        lhs: u32,
        rhs: u32,
        target: Label,
        slow: Label,
        cont: Label,
    },
}

/// One annotation in the code listing.
#[derive(Debug, Clone, Serialize)]
pub struct ListingLine {
    /// Byte offset of the first instruction the annotation covers.
    pub offset: usize,
    pub text: String,
}

/// A finished compiled function in executable memory.
pub struct CompiledFunction {
    memory: ExecutableMemory,
    code_len: usize,
    listing: Vec<ListingLine>,
}

impl CompiledFunction {
    /// The entry point, at the first instruction.
    pub fn entry(&self) -> JitEntry {
        unsafe { std::mem::transmute::<*const u8, JitEntry>(self.memory.as_ptr()) }
    }

    /// Call the compiled function.
    ///
    /// # Safety
    /// The code was generated for the host architecture and `ctx` must be
    /// the kind of context the function was compiled against.
    pub unsafe fn invoke(&self, ctx: &mut ExecContext) -> TaggedValue {
        unsafe { (self.entry())(ctx as *mut ExecContext) }
    }

    /// Length of the instruction stream in bytes.
    pub fn code_len(&self) -> usize {
        self.code_len
    }

    /// The annotations recorded while compiling, in offset order.
    pub fn listing(&self) -> &[ListingLine] {
        &self.listing
    }
}

/// Compiles one function, start to finish, then is consumed by `finalize`.
pub struct Emitter {
    buf: CodeBuffer,
    slow_paths: VecDeque<SlowPathTask>,
    listing: Vec<ListingLine>,
    frame_size: u32,
    user_labels: u32,
}

impl Emitter {
    /// Start compiling a function with `frame_size` virtual-register slots.
    pub fn new(frame_size: u32) -> Self {
        Self {
            buf: CodeBuffer::new(),
            slow_paths: VecDeque::new(),
            listing: Vec::new(),
            frame_size,
            user_labels: 0,
        }
    }

    /// Record a listing annotation at the current offset.
    pub fn comment(&mut self, text: impl Into<String>) {
        self.listing.push(ListingLine {
            offset: self.buf.offset(),
            text: text.into(),
        });
    }

    /// Allocate a label for branch targets in the main instruction stream.
    pub fn new_label(&mut self) -> Label {
        let id = self.user_labels;
        self.user_labels += 1;
        self.buf.new_label(format!("L{id}"))
    }

    /// Bind a label at the current position.
    pub fn bind(&mut self, label: Label) {
        let name = self.buf.label_name(label).to_string();
        self.comment(format!("{name}:"));
        self.buf.bind(label);
    }

    fn new_slow_label(&mut self) -> Label {
        self.buf.new_label(format!("SLOW_{}", self.slow_paths.len()))
    }

    fn new_cont_label(&mut self) -> Label {
        self.buf.new_label(format!("CONT_{}", self.slow_paths.len()))
    }

    /// Displacement of a frame slot, validated against the declared frame
    /// size. An out-of-range slot is an invariant violation.
    fn slot_disp(&self, slot: u32) -> i32 {
        if slot >= self.frame_size {
            panic!(
                "frame slot r{slot} out of range (frame size {})",
                self.frame_size
            );
        }
        slot as i32 * SLOT_SIZE
    }

    fn asm(&mut self) -> X86_64Assembler<'_> {
        X86_64Assembler::new(&mut self.buf)
    }

    // ==================== Frame / ABI ====================

    /// Function entry: reserve the native stack block, pin the context
    /// handle, run the stack-overflow check, enter the language-level frame
    /// and pin its base, zero the root header's live count, and load the
    /// tag boundary. The overflow check runs before the frame is allocated;
    /// that ordering is load-bearing.
    pub fn frame_setup(&mut self) {
        let frame_size = self.frame_size;
        self.comment("frame setup");
        {
            let mut a = self.asm();
            a.push(Reg::Rbp);
            a.mov_rr(Reg::Rbp, Reg::Rsp);
            a.push(regs::FRAME);
            a.push(regs::CTX);
            a.push(regs::RET_STASH);
            a.push(regs::TAG_LIMIT);
            // Root-list header; rsp stays 16-byte aligned for the calls below.
            a.sub_ri32(Reg::Rsp, ROOT_HEADER_SIZE);
            a.mov_rr(regs::CTX, Reg::Rdi);
        }

        // rdi still holds the context handle.
        self.call_service(Service::StackOverflowCheck);

        {
            let mut a = self.asm();
            a.mov_rr(Reg::Rdi, regs::CTX);
            a.mov_rr(Reg::Rsi, Reg::Rsp);
            a.mov_ri32(Reg::Rdx, frame_size as i32);
        }
        self.call_service(Service::FrameEnter);

        self.comment("frame base; zero root count; tag boundary");
        let mut a = self.asm();
        a.mov_rr(regs::FRAME, Reg::Rax);
        a.mov_mi32(Reg::Rsp, RootFrame::COUNT_OFFSET, 0);
        a.mov_ri64(regs::TAG_LIMIT, TAG_BOUNDARY as i64);
    }

    /// Function exit: stash the result slot, leave the language-level frame
    /// (unlinking the root list), restore the saved registers, and return
    /// the stashed value.
    pub fn frame_teardown(&mut self, result_slot: u32) {
        let disp = self.slot_disp(result_slot);
        self.comment(format!("frame teardown, result r{result_slot}"));
        {
            let mut a = self.asm();
            // The frame may be released by frame_leave; read the result first.
            a.mov_rm(regs::RET_STASH, regs::FRAME, disp);
            a.mov_rr(Reg::Rdi, regs::CTX);
            a.mov_rr(Reg::Rsi, Reg::Rsp);
            a.mov_rr(Reg::Rdx, regs::FRAME);
        }
        self.call_service(Service::FrameLeave);

        let mut a = self.asm();
        a.mov_rr(Reg::Rax, regs::RET_STASH);
        a.add_ri32(Reg::Rsp, ROOT_HEADER_SIZE);
        a.pop(regs::TAG_LIMIT);
        a.pop(regs::RET_STASH);
        a.pop(regs::CTX);
        a.pop(regs::FRAME);
        a.pop(Reg::Rbp);
        a.ret();
    }

    // ==================== Runtime call trampoline ====================

    /// Indirect call through the service table: load the entry's function
    /// pointer from the context handle and call it. Arguments must already
    /// be in place. The callee name lands in the listing for inspection.
    fn call_service(&mut self, service: Service) {
        self.comment(format!("call {}", service.name()));
        let mut a = self.asm();
        a.mov_rm(Reg::Rax, regs::CTX, service.offset());
        a.call_r(Reg::Rax);
    }

    // ==================== Operation compilers ====================

    /// Type-agnostic slot copy; always safe, no fast/slow split.
    pub fn mov(&mut self, dest: u32, src: u32) {
        let (dd, sd) = (self.slot_disp(dest), self.slot_disp(src));
        self.comment(format!("mov r{dest}, r{src}"));
        let mut a = self.asm();
        a.mov_rm(Reg::Rax, regs::FRAME, sd);
        a.mov_mr(regs::FRAME, dd, Reg::Rax);
    }

    /// Fetch a call parameter. The runtime always returns a valid tagged
    /// value, so there is no fast path to split off.
    pub fn load_param(&mut self, dest: u32, index: u32) {
        let dd = self.slot_disp(dest);
        self.comment(format!("param r{dest}, {index}"));
        {
            let mut a = self.asm();
            a.mov_rr(Reg::Rdi, regs::CTX);
            a.mov_ri32(Reg::Rsi, index as i32);
        }
        self.call_service(Service::Param);
        let mut a = self.asm();
        a.mov_mr(regs::FRAME, dd, Reg::Rax);
    }

    /// Materialize a double constant. Small integers go through an
    /// integer-to-float conversion; everything else is one immediate load
    /// of the raw bit pattern. Deliberately minimal — no constant pool.
    pub fn load_const(&mut self, dest: u32, value: f64) {
        let dd = self.slot_disp(dest);
        self.comment(format!("loadconst r{dest}, {value}"));
        let mut a = self.asm();
        let small = value as i32;
        if small as f64 == value && value.to_bits() == (small as f64).to_bits() {
            a.mov_ri32(Reg::Rax, small);
            a.cvtsi2sd(Xmm::Xmm0, Reg::Rax);
            a.movq_r64_xmm(Reg::Rax, Xmm::Xmm0);
        } else {
            a.mov_ri64(Reg::Rax, value.to_bits() as i64);
        }
        a.mov_mr(regs::FRAME, dd, Reg::Rax);
    }

    pub fn mul(&mut self, dest: u32, lhs: u32, rhs: u32) {
        self.binary(BinaryOp::Mul, dest, lhs, rhs);
    }

    pub fn inc(&mut self, dest: u32, src: u32) {
        self.unary(UnaryOp::Inc, dest, src);
    }

    pub fn dec(&mut self, dest: u32, src: u32) {
        self.unary(UnaryOp::Dec, dest, src);
    }

    /// Compare-and-branch: jump to `target` when lhs > rhs, or — with
    /// `invert` — when NOT (lhs > rhs). The inverted fast path is
    /// synthesized as "branch over an unconditional jump", so a NaN operand
    /// (which makes `>` false) takes the target exactly when inverted.
    pub fn jgreater(&mut self, invert: bool, lhs: u32, rhs: u32, target: Label) {
        let (ld, rd) = (self.slot_disp(lhs), self.slot_disp(rhs));
        let target_name = self.buf.label_name(target).to_string();
        self.comment(format!(
            "{} {target_name}, r{lhs}, r{rhs}",
            if invert { "jngreater" } else { "jgreater" },
        ));
        let slow = self.new_slow_label();
        let cont = self.new_cont_label();

        {
            let mut a = self.asm();
            a.mov_rm(Reg::Rax, regs::FRAME, ld);
            a.cmp_rr(Reg::Rax, regs::TAG_LIMIT);
            a.jcc(Cond::Ae, slow);
            a.mov_rm(Reg::Rcx, regs::FRAME, rd);
            a.cmp_rr(Reg::Rcx, regs::TAG_LIMIT);
            a.jcc(Cond::Ae, slow);

            a.movq_xmm_r64(Xmm::Xmm0, Reg::Rax);
            a.movq_xmm_r64(Xmm::Xmm1, Reg::Rcx);
            a.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
            if !invert {
                a.jcc(Cond::A, target);
            } else {
                a.jcc(Cond::A, cont);
                a.jmp(target);
            }
        }
        self.buf.bind(cont);

        self.slow_paths.push_back(SlowPathTask::CompareBranch {
            invert,
            lhs,
            rhs,
            target,
            slow,
            cont,
        });
    }

    /// Unconditional jump.
    pub fn jump(&mut self, target: Label) {
        let target_name = self.buf.label_name(target).to_string();
        self.comment(format!("jmp {target_name}"));
        let mut a = self.asm();
        a.jmp(target);
    }

    /// Shared fast/slow template for two-operand arithmetic. Operands are
    /// loaded and classified left to right, matching the order the slow
    /// path passes their addresses to the runtime.
    fn binary(&mut self, op: BinaryOp, dest: u32, lhs: u32, rhs: u32) {
        let (dd, ld, rd) = (
            self.slot_disp(dest),
            self.slot_disp(lhs),
            self.slot_disp(rhs),
        );
        self.comment(format!("{} r{dest}, r{lhs}, r{rhs}", op.name()));
        let slow = self.new_slow_label();
        let cont = self.new_cont_label();

        {
            let mut a = self.asm();
            a.mov_rm(Reg::Rax, regs::FRAME, ld);
            a.cmp_rr(Reg::Rax, regs::TAG_LIMIT);
            a.jcc(Cond::Ae, slow);
            a.mov_rm(Reg::Rcx, regs::FRAME, rd);
            a.cmp_rr(Reg::Rcx, regs::TAG_LIMIT);
            a.jcc(Cond::Ae, slow);

            a.movq_xmm_r64(Xmm::Xmm0, Reg::Rax);
            a.movq_xmm_r64(Xmm::Xmm1, Reg::Rcx);
            match op {
                BinaryOp::Mul => a.mulsd(Xmm::Xmm0, Xmm::Xmm1),
            }
            a.movq_r64_xmm(Reg::Rax, Xmm::Xmm0);
            a.mov_mr(regs::FRAME, dd, Reg::Rax);
        }
        self.buf.bind(cont);

        self.slow_paths.push_back(SlowPathTask::Binary {
            op,
            dest,
            lhs,
            rhs,
            slow,
            cont,
        });
    }

    fn unary(&mut self, op: UnaryOp, dest: u32, src: u32) {
        let (dd, sd) = (self.slot_disp(dest), self.slot_disp(src));
        self.comment(format!("{} r{dest}, r{src}", op.name()));
        let slow = self.new_slow_label();
        let cont = self.new_cont_label();

        {
            let mut a = self.asm();
            a.mov_rm(Reg::Rax, regs::FRAME, sd);
            a.cmp_rr(Reg::Rax, regs::TAG_LIMIT);
            a.jcc(Cond::Ae, slow);

            a.movq_xmm_r64(Xmm::Xmm0, Reg::Rax);
            a.mov_ri64(Reg::Rcx, op.addend().to_bits() as i64);
            a.movq_xmm_r64(Xmm::Xmm1, Reg::Rcx);
            a.addsd(Xmm::Xmm0, Xmm::Xmm1);
            a.movq_r64_xmm(Reg::Rax, Xmm::Xmm0);
            a.mov_mr(regs::FRAME, dd, Reg::Rax);
        }
        self.buf.bind(cont);

        self.slow_paths.push_back(SlowPathTask::Unary {
            op,
            dest,
            src,
            slow,
            cont,
        });
    }

    // ==================== Slow-path scheduler / finalizer ====================

    /// Emit one deferred general path: bind its label, call the matching
    /// runtime entry with the operand slot *addresses*, dispose of the
    /// result, and rejoin the fast path.
    fn emit_slow_path(&mut self, task: SlowPathTask) {
        match task {
            SlowPathTask::Binary {
                op,
                dest,
                lhs,
                rhs,
                slow,
                cont,
            } => {
                let (dd, ld, rd) = (
                    self.slot_disp(dest),
                    self.slot_disp(lhs),
                    self.slot_disp(rhs),
                );
                self.comment(format!("slow path: {} r{dest}, r{lhs}, r{rhs}", op.name()));
                self.buf.bind(slow);
                {
                    let mut a = self.asm();
                    a.mov_rr(Reg::Rdi, regs::CTX);
                    a.lea(Reg::Rsi, regs::FRAME, ld);
                    a.lea(Reg::Rdx, regs::FRAME, rd);
                }
                self.call_service(op.service());
                let mut a = self.asm();
                a.mov_mr(regs::FRAME, dd, Reg::Rax);
                a.jmp(cont);
            }
            SlowPathTask::Unary {
                op,
                dest,
                src,
                slow,
                cont,
            } => {
                let (dd, sd) = (self.slot_disp(dest), self.slot_disp(src));
                self.comment(format!("slow path: {} r{dest}, r{src}", op.name()));
                self.buf.bind(slow);
                {
                    let mut a = self.asm();
                    a.mov_rr(Reg::Rdi, regs::CTX);
                    a.lea(Reg::Rsi, regs::FRAME, sd);
                }
                self.call_service(op.service());
                let mut a = self.asm();
                a.mov_mr(regs::FRAME, dd, Reg::Rax);
                a.jmp(cont);
            }
            SlowPathTask::CompareBranch {
                invert,
                lhs,
                rhs,
                target,
                slow,
                cont,
            } => {
                let (ld, rd) = (self.slot_disp(lhs), self.slot_disp(rhs));
                self.comment(format!(
                    "slow path: {} r{lhs}, r{rhs}",
                    if invert { "jngreater" } else { "jgreater" }
                ));
                self.buf.bind(slow);
                {
                    let mut a = self.asm();
                    a.mov_rr(Reg::Rdi, regs::CTX);
                    a.lea(Reg::Rsi, regs::FRAME, ld);
                    a.lea(Reg::Rdx, regs::FRAME, rd);
                }
                self.call_service(Service::Greater);
                let mut a = self.asm();
                // bool returns in al; the upper bits are garbage.
                a.movzx_r64_r8(Reg::Rax, Reg::Rax);
                a.test_rr(Reg::Rax, Reg::Rax);
                // Same two-way outcome as the fast path, inverted or not.
                if !invert {
                    a.jcc(Cond::Ne, target);
                } else {
                    a.jcc(Cond::E, target);
                }
                a.jmp(cont);
            }
        }
    }

    /// Drain the slow-path queue in enqueue order, patch every label, and
    /// move the finished stream into executable memory.
    ///
    /// Any code-generation or allocation error here is fatal: there is no
    /// safe way to hand back a partially emitted instruction stream.
    pub fn finalize(mut self) -> CompiledFunction {
        while let Some(task) = self.slow_paths.pop_front() {
            self.emit_slow_path(task);
        }

        let code = match self.buf.resolve() {
            Ok(code) => code,
            Err(err) => panic!("code generation failed: {err}"),
        };
        let memory = match ExecutableMemory::from_code(&code) {
            Ok(memory) => memory,
            Err(err) => panic!("executable memory allocation failed: {err}"),
        };

        CompiledFunction {
            memory,
            code_len: code.len(),
            listing: self.listing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_paths_precede_slow_paths_in_compile_order() {
        let mut em = Emitter::new(4);
        em.frame_setup();
        em.mul(0, 1, 2);
        em.dec(1, 1);
        em.inc(2, 3);
        em.frame_teardown(0);
        let func = em.finalize();

        let slow: Vec<&ListingLine> = func
            .listing()
            .iter()
            .filter(|l| l.text.starts_with("slow path:"))
            .collect();
        assert_eq!(slow.len(), 3);

        // Every slow block sits after every fast-path annotation. The
        // listing is in emission order, so everything before the first
        // "slow path:" entry belongs to the main stream.
        let first_slow_idx = func
            .listing()
            .iter()
            .position(|l| l.text.starts_with("slow path:"))
            .unwrap();
        let last_fast = func.listing()[..first_slow_idx]
            .iter()
            .map(|l| l.offset)
            .max()
            .unwrap();
        assert!(slow.iter().all(|l| l.offset >= last_fast));

        // Slow blocks appear in the order the operations were compiled.
        assert!(slow[0].text.contains("mul"));
        assert!(slow[1].text.contains("dec"));
        assert!(slow[2].text.contains("inc"));
        assert!(slow[0].offset < slow[1].offset && slow[1].offset < slow[2].offset);
    }

    #[test]
    #[should_panic(expected = "unbound label")]
    fn unbound_branch_target_is_fatal() {
        let mut em = Emitter::new(2);
        em.frame_setup();
        let never_bound = em.new_label();
        em.jgreater(false, 0, 1, never_bound);
        em.frame_teardown(0);
        em.finalize();
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn frame_slot_bounds_are_enforced() {
        let mut em = Emitter::new(2);
        em.frame_setup();
        em.mov(2, 0);
    }

    #[test]
    fn listing_records_service_names() {
        let mut em = Emitter::new(1);
        em.frame_setup();
        em.load_param(0, 1);
        em.frame_teardown(0);
        let func = em.finalize();

        let texts: Vec<&str> = func.listing().iter().map(|l| l.text.as_str()).collect();
        assert!(texts.contains(&"call stack_overflow_check"));
        assert!(texts.contains(&"call frame_enter"));
        assert!(texts.contains(&"call param"));
        assert!(texts.contains(&"call frame_leave"));
    }

    #[test]
    fn const_materialization_small_int_vs_raw_bits() {
        // 1.0 is an exact small integer: imm32 + cvtsi2sd, no movabs of bits.
        let mut em = Emitter::new(1);
        em.load_const(0, 1.0);
        let small = em.buf.code().to_vec();
        assert!(!window_contains(&small, &1.0f64.to_bits().to_le_bytes()));

        // 0.5 is not: the raw bit pattern is loaded as one 64-bit immediate.
        let mut em = Emitter::new(1);
        em.load_const(0, 0.5);
        let bits = em.buf.code().to_vec();
        assert!(window_contains(&bits, &0.5f64.to_bits().to_le_bytes()));
    }

    fn window_contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }
}
