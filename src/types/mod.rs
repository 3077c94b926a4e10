//! Type descriptors and typed data values.
//!
//! Every value that travels over a port or sits in a config slot is
//! tagged with a [`DataType`] registered on the node. Typed access from
//! Rust goes through the [`PortableType`] marker, which ties a plain-data
//! Rust type to the name it is registered under.

use std::sync::Arc;

use sha2::{Digest, Sha256};

pub use value::Value;

mod value;


/// Length of the type fingerprint in bytes.
pub const TYPE_HASH_LEN: usize = 16;

/// Class of a registered type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TypeClass {
    /// Plain scalar.
    Basic,
    /// Plain-layout struct.
    Struct,
    /// Needs bespoke serialisation.
    Custom,
}

/// A process-wide immutable type descriptor.
///
/// Identified by its name, which is unique per node. The 16-byte hash is
/// derived deterministically from the name, so it is stable across module
/// reloads and can be used for equality checks by external tools.
#[derive(Debug)]
pub struct DataType {
    name: String,
    class: TypeClass,
    size: usize,
    schema: Option<String>,
    hash: [u8; TYPE_HASH_LEN],
}

impl DataType {
    pub fn new(name: &str, class: TypeClass, size: usize) -> DataType {
        let digest = Sha256::digest(name.as_bytes());
        let mut hash = [0; TYPE_HASH_LEN];
        hash.copy_from_slice(&digest[..TYPE_HASH_LEN]);

        DataType {
            name: name.to_string(),
            class,
            size,
            schema: None,
            hash,
        }
    }

    /// Descriptor for the basic type a [`PortableType`] maps to.
    pub fn basic<T: PortableType>() -> DataType {
        DataType::new(T::TYPE_NAME, TypeClass::Basic, size_of::<T>())
    }

    /// Descriptor for a plain-layout struct [`PortableType`].
    pub fn structure<T: PortableType>() -> DataType {
        DataType::new(T::TYPE_NAME, TypeClass::Struct, size_of::<T>())
    }

    /// Attach a hex-encoded schema blob for external introspection.
    pub fn with_schema(mut self, schema: &str) -> DataType {
        self.schema = Some(schema.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> TypeClass {
        self.class
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn hash(&self) -> &[u8; TYPE_HASH_LEN] {
        &self.hash
    }
}

/// Returns whether two type handles refer to the same registered type.
///
/// Handle identity, not name comparison: two registrations of the same
/// name (e.g. across a module reload) are distinct types until a port
/// re-resolves its cache.
pub fn same_type(a: &Arc<DataType>, b: &Arc<DataType>) -> bool {
    Arc::ptr_eq(a, b)
}

/// Marker for plain-data Rust types that map to a registered type name.
///
/// # Safety
///
/// Implementors must be valid for every bit pattern of their size and
/// contain no padding bytes that carry meaning, since values are copied
/// in and out of untyped buffers byte-wise.
pub unsafe trait PortableType: Copy + 'static {
    const TYPE_NAME: &'static str;
}

macro_rules! portable {
    ($($t:ty => $name:literal,)*) => {
        $(
            unsafe impl PortableType for $t {
                const TYPE_NAME: &'static str = $name;
            }
        )*
    };
}

portable! {
    u8 => "char",
    i8 => "int8",
    u16 => "uint16",
    i16 => "int16",
    u32 => "uint32",
    i32 => "int",
    u64 => "uint64",
    i64 => "long",
    f32 => "float",
    f64 => "double",
    usize => "size_t",
}
