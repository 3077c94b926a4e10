use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use super::{Block, BlockKind, BlockState};
use crate::error::{Error, Result};
use crate::log_err;
use crate::types::{DataType, Value};

/// Direction of a port, derived from its declared types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PortDir {
    In,
    Out,
    InOut,
}

impl PortDir {
    pub fn is_in(&self) -> bool {
        matches!(self, PortDir::In | PortDir::InOut)
    }

    pub fn is_out(&self) -> bool {
        matches!(self, PortDir::Out | PortDir::InOut)
    }
}

/// Everything needed to build a [`Port`] except the owner back-pointer,
/// which only exists once the block is allocated.
pub(crate) struct PortSeed {
    pub name: String,
    pub doc: String,
    pub in_type_name: Option<String>,
    pub out_type_name: Option<String>,
    pub in_data_len: usize,
    pub out_data_len: usize,
    pub in_ty: Option<Arc<DataType>>,
    pub out_ty: Option<Arc<DataType>>,
}

impl PortSeed {
    pub(crate) fn into_port(self, owner: Weak<Block>) -> Port {
        let dir = match (&self.in_type_name, &self.out_type_name) {
            (Some(_), Some(_)) => PortDir::InOut,
            (Some(_), None) => PortDir::In,
            _ => PortDir::Out,
        };
        Port {
            name: self.name,
            doc: self.doc,
            dir,
            in_type_name: self.in_type_name,
            out_type_name: self.out_type_name,
            in_data_len: self.in_data_len,
            out_data_len: self.out_data_len,
            in_ty: RwLock::new(self.in_ty),
            out_ty: RwLock::new(self.out_ty),
            in_bindings: RwLock::new(Vec::new()),
            out_bindings: RwLock::new(Vec::new()),
            owner,
            read_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
        }
    }
}

/// A named, typed input and/or output of a block.
///
/// Data flow through a port is indirect: writes fan out to the
/// interaction blocks bound to the output side, reads poll the
/// interactions bound to the input side in insertion order until one
/// yields a sample. Binding lists are only restructured while the
/// composition is quiesced; traversal takes the shared side of the
/// lock.
pub struct Port {
    name: String,
    doc: String,
    dir: PortDir,
    in_type_name: Option<String>,
    out_type_name: Option<String>,
    in_data_len: usize,
    out_data_len: usize,
    // Cached resolved type handles; re-resolved when the cached handle
    // no longer matches (type re-registered by a module reload).
    in_ty: RwLock<Option<Arc<DataType>>>,
    out_ty: RwLock<Option<Arc<DataType>>>,
    // Weak: an interaction must outlive its bindings by composition
    // contract; a dead binding is skipped rather than dereferenced.
    in_bindings: RwLock<Vec<Weak<Block>>>,
    out_bindings: RwLock<Vec<Weak<Block>>>,
    owner: Weak<Block>,
    read_count: AtomicU64,
    write_count: AtomicU64,
}

impl Port {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> &str {
        &self.doc
    }

    pub fn dir(&self) -> PortDir {
        self.dir
    }

    pub fn in_type_name(&self) -> Option<&str> {
        self.in_type_name.as_deref()
    }

    pub fn out_type_name(&self) -> Option<&str> {
        self.out_type_name.as_deref()
    }

    pub fn in_data_len(&self) -> usize {
        self.in_data_len
    }

    pub fn out_data_len(&self) -> usize {
        self.out_data_len
    }

    /// Successful reads through this port.
    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    /// Successful writes through this port.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    fn owner(&self) -> Result<Arc<Block>> {
        self.owner.upgrade().ok_or(Error::InvalidPort)
    }

    /// Check `vty` against the resolved output type, re-resolving the
    /// cache against the node table when the handles differ.
    fn check_out_type(&self, vty: &Arc<DataType>) -> Result<()> {
        let declared = self.out_type_name.as_deref().ok_or(Error::InvalidPortDir)?;
        self.check_type(&self.out_ty, declared, vty)
    }

    fn check_in_type(&self, vty: &Arc<DataType>) -> Result<()> {
        let declared = self.in_type_name.as_deref().ok_or(Error::InvalidPortDir)?;
        self.check_type(&self.in_ty, declared, vty)
    }

    fn check_type(
        &self,
        cache: &RwLock<Option<Arc<DataType>>>,
        declared: &str,
        vty: &Arc<DataType>,
    ) -> Result<()> {
        // Fast path: handle identity against the cached resolution.
        {
            let cached = cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(ty) = &*cached {
                if Arc::ptr_eq(ty, vty) {
                    return Ok(());
                }
            }
        }

        // Slow path: the declared name may have been re-registered
        // (module reload); refresh the cache and re-compare.
        let owner = self.owner()?;
        let node = owner.node().ok_or(Error::InvalidPort)?;
        let ty = node
            .type_get(declared)
            .ok_or_else(|| Error::InvalidType(declared.to_string()))?;
        let matches = Arc::ptr_eq(&ty, vty);
        *cache.write().unwrap_or_else(PoisonError::into_inner) = Some(ty);

        if matches {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                expected: declared.to_string(),
                found: vty.name().to_string(),
            })
        }
    }

    /// Write a sample to every active interaction bound to the output
    /// side, in binding order.
    ///
    /// A type mismatch is a hard failure before any binding is touched;
    /// there is no partial dispatch. A failing interaction write is
    /// logged and does not keep the sample from reaching the remaining
    /// bindings.
    pub fn write(&self, value: &Value) -> Result<()> {
        if !self.dir.is_out() {
            if let Ok(owner) = self.owner() {
                log_err!(owner, "port {}: not an OUT port", self.name);
            }
            return Err(Error::InvalidPortDir);
        }

        self.check_out_type(value.ty()).inspect_err(|e| {
            if let Ok(owner) = self.owner() {
                log_err!(owner, "port_write {}: {e}", self.name);
            }
        })?;

        let bindings = self.out_bindings.read().unwrap_or_else(PoisonError::into_inner);
        if bindings.is_empty() {
            return Ok(());
        }

        for binding in bindings.iter() {
            let Some(ib) = binding.upgrade() else {
                continue;
            };
            if ib.state() != BlockState::Active {
                continue;
            }
            if let Err(e) = ib.interaction_write(value) {
                if let Ok(owner) = self.owner() {
                    log_err!(owner, "port {}: write to {} failed: {e}", self.name, ib.name());
                }
            }
        }

        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Read one sample from the first active interaction that yields
    /// data, in binding order. Returns the number of elements copied
    /// into `dst`, 0 when no binding had data.
    pub fn read(&self, dst: &mut Value) -> Result<usize> {
        if dst.is_empty() {
            return Err(Error::InvalidArg("zero-length read buffer".to_string()));
        }
        if !self.dir.is_in() {
            return Err(Error::InvalidPortDir);
        }

        self.check_in_type(dst.ty()).inspect_err(|e| {
            if let Ok(owner) = self.owner() {
                log_err!(owner, "port_read {}: {e}", self.name);
            }
        })?;

        let bindings = self.in_bindings.read().unwrap_or_else(PoisonError::into_inner);
        for binding in bindings.iter() {
            let Some(ib) = binding.upgrade() else {
                continue;
            };
            if ib.state() != BlockState::Active {
                continue;
            }
            if let Ok(n) = ib.interaction_read(dst) {
                if n > 0 {
                    self.read_count.fetch_add(1, Ordering::Relaxed);
                    return Ok(n);
                }
            }
        }

        Ok(0)
    }

    /// Convenience: write a single element of a portable type through
    /// the port, allocating a fresh value. Hot paths should keep a
    /// cached [`Value`] instead.
    pub fn write_scalar<T: crate::types::PortableType>(&self, v: T) -> Result<()> {
        let ty = self.resolved_out()?;
        let value = Value::from_slice(&ty, std::slice::from_ref(&v))?;
        self.write(&value)
    }

    /// Convenience: read a single element of a portable type; `None`
    /// when no data was available.
    pub fn read_scalar<T: crate::types::PortableType>(&self) -> Result<Option<T>> {
        let ty = self.resolved_in()?;
        let mut value = Value::new(&ty, 1);
        match self.read(&mut value)? {
            0 => Ok(None),
            _ => Ok(Some(value.scalar::<T>()?)),
        }
    }

    /// Resolved output type handle.
    pub fn resolved_out(&self) -> Result<Arc<DataType>> {
        self.out_ty
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::InvalidPortType)
    }

    /// Resolved input type handle.
    pub fn resolved_in(&self) -> Result<Arc<DataType>> {
        self.in_ty
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::InvalidPortType)
    }

    /// Append an interaction to the output binding list.
    pub fn connect_out(&self, iblock: &Arc<Block>) -> Result<()> {
        self.connect(&self.out_bindings, PortDir::is_out, iblock)
    }

    /// Append an interaction to the input binding list.
    pub fn connect_in(&self, iblock: &Arc<Block>) -> Result<()> {
        self.connect(&self.in_bindings, PortDir::is_in, iblock)
    }

    fn connect(
        &self,
        list: &RwLock<Vec<Weak<Block>>>,
        dir_ok: fn(&PortDir) -> bool,
        iblock: &Arc<Block>,
    ) -> Result<()> {
        if iblock.kind() != BlockKind::Interaction {
            return Err(Error::InvalidBlockType);
        }
        if !dir_ok(&self.dir) {
            return Err(Error::InvalidPortDir);
        }
        list.write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(iblock));
        Ok(())
    }

    /// Remove an interaction from the output binding list by identity.
    ///
    /// The last element is swapped into the removed slot, so binding
    /// order is not preserved across disconnects.
    pub fn disconnect_out(&self, iblock: &Arc<Block>) -> Result<()> {
        self.disconnect(&self.out_bindings, iblock)
    }

    /// Remove an interaction from the input binding list by identity.
    pub fn disconnect_in(&self, iblock: &Arc<Block>) -> Result<()> {
        self.disconnect(&self.in_bindings, iblock)
    }

    fn disconnect(&self, list: &RwLock<Vec<Weak<Block>>>, iblock: &Arc<Block>) -> Result<()> {
        let needle = Arc::downgrade(iblock);
        let mut list = list.write().unwrap_or_else(PoisonError::into_inner);
        match list.iter().position(|w| w.ptr_eq(&needle)) {
            Some(idx) => {
                list.swap_remove(idx);
                Ok(())
            }
            None => Err(Error::NoSuchEntity(iblock.name().to_string())),
        }
    }

    pub(crate) fn num_out_bindings(&self) -> usize {
        self.out_bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn num_in_bindings(&self) -> usize {
        self.in_bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Connect `out_port` to `in_port` through `iblock`.
///
/// Appends to the output list first; if the input append fails the
/// output append is rolled back, so the connection is all-or-nothing.
pub fn connect_uni(out_port: &Port, in_port: &Port, iblock: &Arc<Block>) -> Result<()> {
    out_port.connect_out(iblock)?;
    if let Err(e) = in_port.connect_in(iblock) {
        let _ = out_port.disconnect_out(iblock);
        return Err(e);
    }
    Ok(())
}

/// Undo [`connect_uni`]. Both removals are attempted; the first error
/// wins.
pub fn disconnect_uni(out_port: &Port, in_port: &Port, iblock: &Arc<Block>) -> Result<()> {
    let out = out_port.disconnect_out(iblock);
    let inp = in_port.disconnect_in(iblock);
    out.and(inp)
}
