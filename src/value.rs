//! NaN-boxed 64-bit value encoding.
//!
//! Doubles occupy the numerically low unsigned range of the encoding;
//! everything else lives in one of the 2^48-sized tag windows at or above
//! [`TAG_BOUNDARY`]. Classifying any value is a single unsigned comparison,
//! which is exactly the comparison the generated code performs against the
//! pinned boundary register.

/// Number of payload bits below the tag.
pub const NUM_DATA_BITS: u32 = 48;

/// First tag window. Everything unsigned-below `TAG_FIRST << 48` is a double.
pub const TAG_FIRST: u64 = 0xfff9;

/// The fast-path comparison constant: `bits < TAG_BOUNDARY` means double.
///
/// This is a wire-level contract shared with the runtime's own tagging
/// scheme; the generated code loads it once per compiled function.
pub const TAG_BOUNDARY: u64 = TAG_FIRST << NUM_DATA_BITS;

const PAYLOAD_MASK: u64 = (1 << NUM_DATA_BITS) - 1;

/// Value kind tags, one 2^48 window each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Tag {
    Undefined = 0xfff9,
    Null = 0xfffa,
    Bool = 0xfffb,
    Object = 0xfffc,
}

/// Result of classifying a bit pattern against the tag boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueClass {
    /// A double; eligible for inline arithmetic.
    Numeric,
    /// Anything else; must go through a runtime entry point.
    General,
}

/// Classify a raw 64-bit pattern.
pub fn classify(bits: u64) -> ValueClass {
    if bits < TAG_BOUNDARY {
        ValueClass::Numeric
    } else {
        ValueClass::General
    }
}

/// A NaN-boxed runtime value.
///
/// `#[repr(transparent)]` over `u64` so it crosses the generated-code ABI
/// boundary as a plain integer register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct TaggedValue(u64);

impl TaggedValue {
    pub const UNDEFINED: TaggedValue = TaggedValue::tagged(Tag::Undefined, 0);
    pub const NULL: TaggedValue = TaggedValue::tagged(Tag::Null, 0);

    const fn tagged(tag: Tag, payload: u64) -> Self {
        TaggedValue(((tag as u64) << NUM_DATA_BITS) | (payload & PAYLOAD_MASK))
    }

    /// Encode a double. NaNs are normalized to the canonical quiet NaN so
    /// the result always stays below the tag boundary.
    pub fn double(v: f64) -> Self {
        if v.is_nan() {
            TaggedValue(f64::NAN.to_bits())
        } else {
            TaggedValue(v.to_bits())
        }
    }

    pub fn bool(b: bool) -> Self {
        Self::tagged(Tag::Bool, b as u64)
    }

    /// Encode a raw object pointer. The address must fit the 48-bit payload.
    pub fn object(ptr: *const ()) -> Self {
        let bits = ptr as u64;
        debug_assert_eq!(bits & !PAYLOAD_MASK, 0, "pointer exceeds 48 bits");
        Self::tagged(Tag::Object, bits)
    }

    pub fn from_bits(bits: u64) -> Self {
        TaggedValue(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn class(self) -> ValueClass {
        classify(self.0)
    }

    pub fn is_double(self) -> bool {
        self.class() == ValueClass::Numeric
    }

    pub fn tag(self) -> Option<Tag> {
        match self.0 >> NUM_DATA_BITS {
            _ if self.is_double() => None,
            0xfff9 => Some(Tag::Undefined),
            0xfffa => Some(Tag::Null),
            0xfffb => Some(Tag::Bool),
            0xfffc => Some(Tag::Object),
            _ => None,
        }
    }

    /// Reinterpret as a double. Only meaningful when `is_double()`.
    pub fn as_double(self) -> f64 {
        f64::from_bits(self.0)
    }

    pub fn payload(self) -> u64 {
        self.0 & PAYLOAD_MASK
    }
}
