use std::slice;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{DataType, PortableType};

// Backing storage is allocated in 16-byte chunks so that typed views are
// aligned for every registered type (largest alignment in the runtime is 8).
const CHUNK: usize = 16;

#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct Chunk([u8; CHUNK]);

/// A typed, length-tagged data region: `(type, element count, bytes)`.
///
/// The byte length is always `ty.size() * len`. Values back config slots
/// and carry samples through ports and interactions.
pub struct Value {
    ty: Arc<DataType>,
    len: usize,
    buf: Vec<Chunk>,
}

fn chunks_for(bytes: usize) -> usize {
    bytes.div_ceil(CHUNK)
}

impl Value {
    /// A zero-initialised value of `len` elements of `ty`.
    pub fn new(ty: &Arc<DataType>, len: usize) -> Value {
        Value {
            ty: Arc::clone(ty),
            len,
            buf: vec![Chunk([0; CHUNK]); chunks_for(ty.size() * len)],
        }
    }

    /// A value holding a copy of `data`. The type must match `T`'s
    /// registered name.
    pub fn from_slice<T: PortableType>(ty: &Arc<DataType>, data: &[T]) -> Result<Value> {
        check_view::<T>(ty)?;
        let mut val = Value::new(ty, data.len());
        val.as_mut_slice::<T>()?.copy_from_slice(data);
        Ok(val)
    }

    /// A `char`-array value holding the bytes of `s`.
    pub fn from_str(ty: &Arc<DataType>, s: &str) -> Result<Value> {
        Value::from_slice::<u8>(ty, s.as_bytes())
    }

    pub fn ty(&self) -> &Arc<DataType> {
        &self.ty
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.ty.size() * self.len
    }

    pub fn bytes(&self) -> &[u8] {
        let n = self.size_bytes();
        unsafe { slice::from_raw_parts(self.buf.as_ptr() as *const u8, n) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let n = self.size_bytes();
        unsafe { slice::from_raw_parts_mut(self.buf.as_mut_ptr() as *mut u8, n) }
    }

    /// Resize in place to `len` elements; new elements are zeroed.
    pub fn resize(&mut self, len: usize) {
        let old_bytes = self.size_bytes();
        self.buf.resize(chunks_for(self.ty.size() * len), Chunk([0; CHUNK]));
        self.len = len;
        if self.size_bytes() > old_bytes {
            // Vec::resize only zeroes whole new chunks; stale bytes may
            // remain in the previously last, partially-used one.
            self.bytes_mut()[old_bytes..].fill(0);
        }
    }

    pub fn as_slice<T: PortableType>(&self) -> Result<&[T]> {
        check_view::<T>(&self.ty)?;
        // Aligned by the chunked allocation, length checked against the
        // type size by construction.
        Ok(unsafe { slice::from_raw_parts(self.buf.as_ptr() as *const T, self.len) })
    }

    pub fn as_mut_slice<T: PortableType>(&mut self) -> Result<&mut [T]> {
        check_view::<T>(&self.ty)?;
        Ok(unsafe { slice::from_raw_parts_mut(self.buf.as_mut_ptr() as *mut T, self.len) })
    }

    /// First element of a typed view; `InvalidArg` when empty.
    pub fn scalar<T: PortableType>(&self) -> Result<T> {
        let s = self.as_slice::<T>()?;
        s.first()
            .copied()
            .ok_or_else(|| Error::InvalidArg("empty value".to_string()))
    }

    /// Replace the contents with a copy of `data`, resizing as needed.
    pub fn set_slice<T: PortableType>(&mut self, data: &[T]) -> Result<()> {
        check_view::<T>(&self.ty)?;
        self.resize(data.len());
        self.as_mut_slice::<T>()?.copy_from_slice(data);
        Ok(())
    }

    /// Replace the contents with a single element.
    pub fn set_scalar<T: PortableType>(&mut self, v: T) -> Result<()> {
        self.set_slice(slice::from_ref(&v))
    }

    /// View a `char`-array value as a string, trimming trailing NULs.
    pub fn as_str(&self) -> Result<&str> {
        if self.ty.name() != u8::TYPE_NAME {
            return Err(Error::TypeMismatch {
                expected: u8::TYPE_NAME.to_string(),
                found: self.ty.name().to_string(),
            });
        }
        let bytes = self.bytes();
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[..end])
            .map_err(|_| Error::InvalidArg("non-utf8 char array".to_string()))
    }
}

impl Clone for Value {
    fn clone(&self) -> Value {
        Value {
            ty: Arc::clone(&self.ty),
            len: self.len,
            buf: self.buf.clone(),
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value")
            .field("type", &self.ty.name())
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

fn check_view<T: PortableType>(ty: &Arc<DataType>) -> Result<()> {
    if ty.name() != T::TYPE_NAME || ty.size() != size_of::<T>() {
        return Err(Error::TypeMismatch {
            expected: T::TYPE_NAME.to_string(),
            found: ty.name().to_string(),
        });
    }
    debug_assert!(
        align_of::<T>() <= CHUNK,
        "{} over-aligned for value storage",
        ty.name()
    );
    Ok(())
}
