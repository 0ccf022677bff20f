//! tagjit - a template JIT for a NaN-boxed tagged-value runtime.
//!
//! Compiles a sequence of register-based, dynamically-typed operations into
//! directly executable x86-64 machine code. Numeric operands take an inline
//! fast path; everything else branches to deferred out-of-line code that
//! calls back into the runtime through an offset-based services table.

pub mod codebuf;
pub mod emitter;
pub mod memory;
pub mod runtime;
pub mod samples;
pub mod value;
pub mod x86_64;

// Re-export commonly used types
pub use emitter::{CompiledFunction, Emitter};
pub use runtime::{ExecContext, Service, ServiceTable};
pub use value::{TAG_BOUNDARY, TaggedValue, ValueClass, classify};
