//! Execution context and runtime services table.
//!
//! Generated code never links against runtime symbols. It receives one
//! `*mut ExecContext` argument and dispatches every runtime call through the
//! [`ServiceTable`] embedded at offset 0 of the context, using fixed byte
//! offsets. The table layout is a versioned contract: the emitter is built
//! against exactly this layout, and the `table_layout` test pins it.

use std::mem::offset_of;

use crate::value::{Tag, TaggedValue};

/// Bump on any change to [`ServiceTable`] layout.
pub const SERVICE_TABLE_VERSION: u64 = 1;

/// Capacity of the register stack frames are carved from.
const REGISTER_STACK_SLOTS: usize = 4096;

/// Signature of a compiled function.
pub type JitEntry = unsafe extern "C" fn(*mut ExecContext) -> TaggedValue;

/// GC root-list header, allocated in the native stack frame of each
/// compiled function and linked into the context on frame entry.
#[repr(C)]
pub struct RootFrame {
    pub prev: *mut RootFrame,
    /// Live-root count. Generated code zeroes this right after frame entry.
    pub count: u32,
}

impl RootFrame {
    pub const COUNT_OFFSET: i32 = offset_of!(RootFrame, count) as i32;
}

/// Function-pointer table of the general-purpose runtime entry points.
///
/// First argument is always the execution-context handle. Arithmetic and
/// comparison entries take frame-slot *addresses*, so the callee may read,
/// coerce, or box without the generated code copying values around.
#[repr(C)]
pub struct ServiceTable {
    pub version: u64,
    pub stack_overflow_check: unsafe extern "C" fn(*mut ExecContext),
    pub frame_enter:
        unsafe extern "C" fn(*mut ExecContext, *mut RootFrame, u32) -> *mut TaggedValue,
    pub frame_leave: unsafe extern "C" fn(*mut ExecContext, *mut RootFrame, *mut TaggedValue),
    pub param: unsafe extern "C" fn(*mut ExecContext, u32) -> TaggedValue,
    pub mul:
        unsafe extern "C" fn(*mut ExecContext, *const TaggedValue, *const TaggedValue) -> TaggedValue,
    pub inc: unsafe extern "C" fn(*mut ExecContext, *const TaggedValue) -> TaggedValue,
    pub dec: unsafe extern "C" fn(*mut ExecContext, *const TaggedValue) -> TaggedValue,
    pub greater:
        unsafe extern "C" fn(*mut ExecContext, *const TaggedValue, *const TaggedValue) -> bool,
}

/// Symbolic names for the table entries, used by the emitter's trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    StackOverflowCheck,
    FrameEnter,
    FrameLeave,
    Param,
    Mul,
    Inc,
    Dec,
    Greater,
}

impl Service {
    /// Byte offset of this entry from the context-handle base.
    pub fn offset(self) -> i32 {
        let field = match self {
            Service::StackOverflowCheck => offset_of!(ServiceTable, stack_overflow_check),
            Service::FrameEnter => offset_of!(ServiceTable, frame_enter),
            Service::FrameLeave => offset_of!(ServiceTable, frame_leave),
            Service::Param => offset_of!(ServiceTable, param),
            Service::Mul => offset_of!(ServiceTable, mul),
            Service::Inc => offset_of!(ServiceTable, inc),
            Service::Dec => offset_of!(ServiceTable, dec),
            Service::Greater => offset_of!(ServiceTable, greater),
        };
        (offset_of!(ExecContext, services) + field) as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            Service::StackOverflowCheck => "stack_overflow_check",
            Service::FrameEnter => "frame_enter",
            Service::FrameLeave => "frame_leave",
            Service::Param => "param",
            Service::Mul => "mul",
            Service::Inc => "inc",
            Service::Dec => "dec",
            Service::Greater => "greater",
        }
    }
}

/// Per-entry invocation counters for the general-path services.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlowCallCounts {
    pub mul: u64,
    pub inc: u64,
    pub dec: u64,
    pub greater: u64,
}

/// The process-wide execution context compiled functions borrow.
///
/// The service table sits at offset 0; everything after it is interpreter
/// state that generated code never addresses directly.
#[repr(C)]
pub struct ExecContext {
    services: ServiceTable,
    register_stack: Box<[TaggedValue]>,
    stack_top: usize,
    root_head: *mut RootFrame,
    params: Vec<TaggedValue>,
    heap: Vec<Box<f64>>,
    /// Times the stack-overflow check ran.
    pub overflow_checks: u64,
    /// Times each general-path entry ran.
    pub slow_calls: SlowCallCounts,
    /// Stays true as long as every operand address a general-path entry
    /// received pointed into the register stack.
    pub operands_in_frame: bool,
}

impl ExecContext {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            services: ServiceTable {
                version: SERVICE_TABLE_VERSION,
                stack_overflow_check: svc_stack_overflow_check,
                frame_enter: svc_frame_enter,
                frame_leave: svc_frame_leave,
                param: svc_param,
                mul: svc_mul,
                inc: svc_inc,
                dec: svc_dec,
                greater: svc_greater,
            },
            register_stack: vec![TaggedValue::UNDEFINED; REGISTER_STACK_SLOTS].into_boxed_slice(),
            stack_top: 0,
            root_head: std::ptr::null_mut(),
            params: vec![TaggedValue::UNDEFINED],
            heap: Vec::new(),
            overflow_checks: 0,
            slow_calls: SlowCallCounts::default(),
            operands_in_frame: true,
        })
    }

    /// Set the call arguments for the next invocation. Parameter 0 is the
    /// `this` value and stays undefined; `args[0]` becomes parameter 1.
    pub fn set_args(&mut self, args: &[TaggedValue]) {
        self.params.clear();
        self.params.push(TaggedValue::UNDEFINED);
        self.params.extend_from_slice(args);
    }

    /// Allocate a heap cell holding a double and return the object value
    /// pointing at it. Such values always take the general path.
    pub fn boxed_number(&mut self, v: f64) -> TaggedValue {
        let cell = Box::new(v);
        let ptr = &*cell as *const f64;
        self.heap.push(cell);
        TaggedValue::object(ptr as *const ())
    }

    /// Length of the GC root list.
    pub fn root_depth(&self) -> usize {
        let mut depth = 0;
        let mut cur = self.root_head;
        while !cur.is_null() {
            depth += 1;
            cur = unsafe { (*cur).prev };
        }
        depth
    }

    pub fn reset_counters(&mut self) {
        self.overflow_checks = 0;
        self.slow_calls = SlowCallCounts::default();
        self.operands_in_frame = true;
    }

    fn in_register_stack(&self, ptr: *const TaggedValue) -> bool {
        let base = self.register_stack.as_ptr();
        let end = unsafe { base.add(self.register_stack.len()) };
        ptr >= base && ptr < end
    }

    fn note_operand(&mut self, ptr: *const TaggedValue) {
        self.operands_in_frame &= self.in_register_stack(ptr);
    }

    /// The coercion every general-path arithmetic entry applies.
    pub fn to_number(&self, v: TaggedValue) -> f64 {
        if v.is_double() {
            return v.as_double();
        }
        match v.tag() {
            Some(Tag::Undefined) | None => f64::NAN,
            Some(Tag::Null) => 0.0,
            Some(Tag::Bool) => v.payload() as f64,
            Some(Tag::Object) => unsafe { *(v.payload() as *const f64) },
        }
    }
}

/// Invariant violation inside a runtime entry point. Unwinding across the
/// generated-code boundary is not an option, so terminate.
fn fatal(msg: &str) -> ! {
    eprintln!("tagjit runtime: fatal: {msg}");
    std::process::abort();
}

unsafe extern "C" fn svc_stack_overflow_check(ctx: *mut ExecContext) {
    let ctx = unsafe { &mut *ctx };
    ctx.overflow_checks += 1;
}

unsafe extern "C" fn svc_frame_enter(
    ctx: *mut ExecContext,
    root: *mut RootFrame,
    size: u32,
) -> *mut TaggedValue {
    let ctx = unsafe { &mut *ctx };
    if ctx.stack_top + size as usize > ctx.register_stack.len() {
        fatal("register stack exhausted");
    }

    unsafe {
        (*root).prev = ctx.root_head;
    }
    ctx.root_head = root;

    let base = unsafe { ctx.register_stack.as_mut_ptr().add(ctx.stack_top) };
    for i in 0..size as usize {
        unsafe {
            *base.add(i) = TaggedValue::UNDEFINED;
        }
    }
    ctx.stack_top += size as usize;
    base
}

unsafe extern "C" fn svc_frame_leave(
    ctx: *mut ExecContext,
    root: *mut RootFrame,
    frame: *mut TaggedValue,
) {
    let ctx = unsafe { &mut *ctx };
    if ctx.root_head != root {
        fatal("frame leave out of order");
    }
    ctx.root_head = unsafe { (*root).prev };

    let base = ctx.register_stack.as_ptr();
    let released = unsafe { frame.offset_from(base) };
    if released < 0 || released as usize > ctx.stack_top {
        fatal("frame pointer outside register stack");
    }
    ctx.stack_top = released as usize;
}

unsafe extern "C" fn svc_param(ctx: *mut ExecContext, index: u32) -> TaggedValue {
    let ctx = unsafe { &mut *ctx };
    ctx.params
        .get(index as usize)
        .copied()
        .unwrap_or(TaggedValue::UNDEFINED)
}

unsafe extern "C" fn svc_mul(
    ctx: *mut ExecContext,
    lhs: *const TaggedValue,
    rhs: *const TaggedValue,
) -> TaggedValue {
    let ctx = unsafe { &mut *ctx };
    ctx.slow_calls.mul += 1;
    ctx.note_operand(lhs);
    ctx.note_operand(rhs);
    let (l, r) = unsafe { (*lhs, *rhs) };
    TaggedValue::double(ctx.to_number(l) * ctx.to_number(r))
}

unsafe extern "C" fn svc_inc(ctx: *mut ExecContext, v: *const TaggedValue) -> TaggedValue {
    let ctx = unsafe { &mut *ctx };
    ctx.slow_calls.inc += 1;
    ctx.note_operand(v);
    let v = unsafe { *v };
    TaggedValue::double(ctx.to_number(v) + 1.0)
}

unsafe extern "C" fn svc_dec(ctx: *mut ExecContext, v: *const TaggedValue) -> TaggedValue {
    let ctx = unsafe { &mut *ctx };
    ctx.slow_calls.dec += 1;
    ctx.note_operand(v);
    let v = unsafe { *v };
    TaggedValue::double(ctx.to_number(v) - 1.0)
}

unsafe extern "C" fn svc_greater(
    ctx: *mut ExecContext,
    lhs: *const TaggedValue,
    rhs: *const TaggedValue,
) -> bool {
    let ctx = unsafe { &mut *ctx };
    ctx.slow_calls.greater += 1;
    ctx.note_operand(lhs);
    ctx.note_operand(rhs);
    let (l, r) = unsafe { (*lhs, *rhs) };
    ctx.to_number(l) > ctx.to_number(r)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_layout() {
        // The emitter is generated against these exact offsets. Any drift
        // here is a silent miscompile, so pin every one.
        assert_eq!(offset_of!(ExecContext, services), 0);
        assert_eq!(offset_of!(ServiceTable, version), 0);
        assert_eq!(Service::StackOverflowCheck.offset(), 8);
        assert_eq!(Service::FrameEnter.offset(), 16);
        assert_eq!(Service::FrameLeave.offset(), 24);
        assert_eq!(Service::Param.offset(), 32);
        assert_eq!(Service::Mul.offset(), 40);
        assert_eq!(Service::Inc.offset(), 48);
        assert_eq!(Service::Dec.offset(), 56);
        assert_eq!(Service::Greater.offset(), 64);
        assert_eq!(RootFrame::COUNT_OFFSET, 8);

        let ctx = ExecContext::new();
        assert_eq!(ctx.services.version, SERVICE_TABLE_VERSION);
    }

    #[test]
    fn frame_enter_links_and_leave_unlinks() {
        let mut ctx = ExecContext::new();
        let mut root = RootFrame {
            prev: std::ptr::null_mut(),
            count: 0,
        };
        assert_eq!(ctx.root_depth(), 0);

        let frame = unsafe { svc_frame_enter(&mut *ctx, &mut root, 6) };
        assert_eq!(ctx.root_depth(), 1);
        assert_eq!(ctx.stack_top, 6);
        assert_eq!(unsafe { *frame }, TaggedValue::UNDEFINED);

        unsafe { svc_frame_leave(&mut *ctx, &mut root, frame) };
        assert_eq!(ctx.root_depth(), 0);
        assert_eq!(ctx.stack_top, 0);
    }

    #[test]
    fn param_fetch() {
        let mut ctx = ExecContext::new();
        ctx.set_args(&[TaggedValue::double(5.0)]);
        let p0 = unsafe { svc_param(&mut *ctx, 0) };
        let p1 = unsafe { svc_param(&mut *ctx, 1) };
        let p9 = unsafe { svc_param(&mut *ctx, 9) };
        assert_eq!(p0, TaggedValue::UNDEFINED);
        assert_eq!(p1.as_double(), 5.0);
        assert_eq!(p9, TaggedValue::UNDEFINED);
    }

    #[test]
    fn to_number_coercions() {
        let mut ctx = ExecContext::new();
        assert_eq!(ctx.to_number(TaggedValue::double(2.5)), 2.5);
        assert!(ctx.to_number(TaggedValue::UNDEFINED).is_nan());
        assert_eq!(ctx.to_number(TaggedValue::NULL), 0.0);
        assert_eq!(ctx.to_number(TaggedValue::bool(true)), 1.0);
        let boxed = ctx.boxed_number(7.25);
        assert_eq!(ctx.to_number(boxed), 7.25);
    }

    #[test]
    fn general_ops_coerce_and_count() {
        let mut ctx = ExecContext::new();
        let l = ctx.boxed_number(6.0);
        let r = TaggedValue::double(7.0);
        let out = unsafe { svc_mul(&mut *ctx, &l, &r) };
        assert_eq!(out.as_double(), 42.0);
        assert_eq!(ctx.slow_calls.mul, 1);

        let nan = unsafe { svc_greater(&mut *ctx, &TaggedValue::UNDEFINED, &r) };
        assert!(!nan);
        assert_eq!(ctx.slow_calls.greater, 1);
    }
}
