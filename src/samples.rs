//! Hand-built sample programs.

use crate::emitter::{CompiledFunction, Emitter};

/// The factorial-like loop, issued as a fixed 10-operation sequence over a
/// 6-slot frame:
///
/// ```text
/// r0 = param 1
/// r3 = r0 - 1
/// r2 = 1.0
/// r1 = r0; r0 = r1
/// if !(r3 > r2) goto L1
/// L2:
///   r1 = r1 * r3
///   r3 = r3 - 1
///   r0 = r1
///   if r3 > r2 goto L2
/// L1:
/// return r0
/// ```
///
/// With parameter 5.0 the result is 120.0; with 1.0 the loop body never
/// runs and the result is 1.0.
pub fn factorial_loop() -> CompiledFunction {
    let mut em = Emitter::new(6);
    em.frame_setup();

    em.load_param(0, 1);
    em.dec(3, 0);
    em.load_const(2, 1.0);
    em.mov(1, 0);
    em.mov(0, 1);

    let l1 = em.new_label();
    em.jgreater(true, 3, 2, l1);

    let l2 = em.new_label();
    em.bind(l2);
    em.mul(1, 1, 3);
    em.dec(3, 3);
    em.mov(0, 1);
    em.jgreater(false, 3, 2, l2);

    em.bind(l1);
    em.frame_teardown(0);

    em.finalize()
}
