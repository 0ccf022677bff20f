//! Code buffer for building machine code.
//!
//! Collects instruction bytes and label references while a function is being
//! compiled. Labels are symbolic code addresses: a label may be referenced by
//! any number of rel32 branches before it is bound, but must be bound exactly
//! once before [`CodeBuffer::resolve`] runs.

/// A symbolic code address, allocated by [`CodeBuffer::new_label`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

struct LabelState {
    name: String,
    /// Byte offset the label was bound at, once bound.
    offset: Option<usize>,
}

/// A buffer for building machine code.
pub struct CodeBuffer {
    code: Vec<u8>,
    labels: Vec<LabelState>,
    /// Sites of not-yet-patched rel32 fields: (patch offset, target label).
    refs: Vec<(usize, Label)>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            labels: Vec::new(),
            refs: Vec::new(),
        }
    }

    /// Current size of the code, which is also the offset of the next
    /// emitted byte.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Allocate a fresh, unbound label.
    pub fn new_label(&mut self, name: impl Into<String>) -> Label {
        let id = self.labels.len() as u32;
        self.labels.push(LabelState {
            name: name.into(),
            offset: None,
        });
        Label(id)
    }

    /// Bind a label to the current offset. Binding twice is an invariant
    /// violation and aborts compilation.
    pub fn bind(&mut self, label: Label) {
        let state = &mut self.labels[label.0 as usize];
        if state.offset.is_some() {
            panic!("label {} bound twice", state.name);
        }
        state.offset = Some(self.code.len());
    }

    pub fn label_name(&self, label: Label) -> &str {
        &self.labels[label.0 as usize].name
    }

    pub fn is_bound(&self, label: Label) -> bool {
        self.labels[label.0 as usize].offset.is_some()
    }

    /// Emit a rel32 field referring to `label`, to be patched at resolve
    /// time. The field is relative to the end of itself, which is how every
    /// x86-64 near branch encodes its displacement.
    pub fn emit_label_rel32(&mut self, label: Label) {
        self.refs.push((self.code.len(), label));
        self.emit_u32(0);
    }

    /// Patch every label reference and return the finished byte stream.
    ///
    /// Fails if any referenced label was never bound, or if a displacement
    /// does not fit in 32 bits.
    pub fn resolve(mut self) -> Result<Vec<u8>, String> {
        for (site, label) in self.refs.drain(..) {
            let state = &self.labels[label.0 as usize];
            let target = state
                .offset
                .ok_or_else(|| format!("unbound label: {}", state.name))?;
            let rel = (target as i64) - (site as i64 + 4);
            if rel < i32::MIN as i64 || rel > i32::MAX as i64 {
                return Err(format!("rel32 overflow for label: {}", state.name));
            }
            self.code[site..site + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        Ok(self.code)
    }

    /// The bytes emitted so far (label references still unpatched).
    pub fn code(&self) -> &[u8] {
        &self.code
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_bytes() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.emit_u32(0xDEADBEEF);

        assert_eq!(buf.offset(), 5);
        assert_eq!(buf.code(), &[0x90, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn backward_reference_patches() {
        let mut buf = CodeBuffer::new();
        let top = buf.new_label("TOP");
        buf.bind(top);
        buf.emit_u8(0x90);
        buf.emit_u8(0xE9); // JMP rel32
        buf.emit_label_rel32(top);

        let code = buf.resolve().unwrap();
        // Displacement from end of the rel32 field (offset 6) back to 0.
        assert_eq!(&code[2..6], &(-6i32).to_le_bytes());
    }

    #[test]
    fn forward_reference_patches() {
        let mut buf = CodeBuffer::new();
        let skip = buf.new_label("SKIP");
        buf.emit_u8(0xE9);
        buf.emit_label_rel32(skip);
        buf.emit_u8(0x90);
        buf.bind(skip);

        let code = buf.resolve().unwrap();
        assert_eq!(&code[1..5], &1i32.to_le_bytes());
    }

    #[test]
    fn unbound_label_is_an_error() {
        let mut buf = CodeBuffer::new();
        let lab = buf.new_label("SLOW_0");
        buf.emit_u8(0xE9);
        buf.emit_label_rel32(lab);

        let err = buf.resolve().unwrap_err();
        assert!(err.contains("unbound label: SLOW_0"));
    }

    #[test]
    #[should_panic(expected = "bound twice")]
    fn double_bind_panics() {
        let mut buf = CodeBuffer::new();
        let lab = buf.new_label("L");
        buf.bind(lab);
        buf.emit_u8(0x90);
        buf.bind(lab);
    }
}
