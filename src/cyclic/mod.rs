//! The lock-free cyclic interaction.
//!
//! Carries fixed-size typed samples from one producer port to one
//! consumer port without locks on the hot path. Exactly one producer
//! and one consumer per instance — this is a composition contract, not
//! enforced by the code.
//!
//! When the ring is full the new sample is dropped (`DropNew`) and an
//! `overruns` counter is published on a dedicated port, only when it
//! changes. Dropping is not an error to the producer.
//!
//! The [`CyclicMod`] module registers the `cyclic` prototype; its
//! config and port types come from the `stdtypes` module, which must be
//! loaded first.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ring::Ring;

use crate::block::{Block, BlockProto, ConfigSpec, Interaction, Port, PortSpec};
use crate::error::{Error, Result};
use crate::module::Module;
use crate::node::Node;
use crate::types::{same_type, DataType, PortableType, Value};
use crate::{log_err, log_info, log_notice};

mod ring;

#[cfg(test)]
mod test;

/// Prototype name registered by [`CyclicMod`].
pub const CYCLIC_PROTO: &str = "cyclic";

/// Interaction state; allocated in `init` from the `type_name`,
/// `data_len` and `buffer_len` configs.
#[derive(Default)]
pub struct Cyclic {
    ring: Option<Ring>,
    ty: Option<Arc<DataType>>,
    data_len: usize,
    overruns: AtomicU64,
    p_overruns: Option<Arc<Port>>,
    // Producer-only scratch for publishing the overrun counter without
    // allocating; never touched by the consumer side.
    overruns_val: UnsafeCell<Option<Value>>,
}

// The UnsafeCell is confined to the write hook, which the
// single-producer contract serialises.
unsafe impl Send for Cyclic {}
unsafe impl Sync for Cyclic {}

impl Cyclic {
    fn armed(&self) -> Result<(&Ring, &Arc<DataType>)> {
        match (&self.ring, &self.ty) {
            (Some(ring), Some(ty)) => Ok((ring, ty)),
            _ => Err(Error::InvalidBlock),
        }
    }

    fn publish_overrun(&self, b: &Block, cnt: u64) {
        // Single producer: no concurrent access to the scratch value.
        let val = unsafe { &mut *self.overruns_val.get() };
        if let (Some(port), Some(val)) = (&self.p_overruns, val.as_mut()) {
            if val.set_scalar(cnt).is_ok() {
                if let Err(e) = port.write(val) {
                    log_err!(b, "failed to publish overruns: {e}");
                }
            }
        }
    }
}

impl Interaction for Cyclic {
    fn init(&mut self, b: &Block) -> Result<()> {
        let node = b.node().ok_or(Error::InvalidBlock)?;

        let buffer_len = b
            .config_scalar::<u32>("buffer_len")?
            .ok_or_else(|| Error::InvalidConfig("buffer_len unconfigured".to_string()))?;
        if buffer_len == 0 {
            log_err!(b, "config buffer_len=0");
            return Err(Error::InvalidConfig("buffer_len=0".to_string()));
        }

        self.data_len = b.config_scalar::<u32>("data_len")?.unwrap_or(1).max(1) as usize;

        let type_name = b
            .config_str("type_name")?
            .ok_or_else(|| Error::InvalidConfig("type_name unconfigured".to_string()))?;
        let ty = node.type_get(&type_name).ok_or_else(|| {
            log_err!(b, "unknown type {type_name}");
            Error::InvalidConfig(format!("unknown type {type_name}"))
        })?;

        log_info!(
            b,
            "allocating ring of {buffer_len} x {type_name} [{}]",
            self.data_len
        );

        self.ring = Some(Ring::new(buffer_len as usize, self.data_len * ty.size()));
        self.ty = Some(ty);
        self.p_overruns = Some(b.port("overruns")?);

        let overruns_ty = node
            .type_get(<u64 as PortableType>::TYPE_NAME)
            .ok_or_else(|| Error::InvalidType("uint64".to_string()))?;
        *self.overruns_val.get_mut() = Some(Value::new(&overruns_ty, 1));

        Ok(())
    }

    fn cleanup(&mut self, _b: &Block) {
        self.ring = None;
        self.ty = None;
        self.p_overruns = None;
        *self.overruns_val.get_mut() = None;
        self.overruns.store(0, Ordering::Relaxed);
    }

    fn write(&self, b: &Block, value: &Value) -> Result<()> {
        let (ring, ty) = self.armed()?;

        if !same_type(value.ty(), ty) {
            log_err!(b, "invalid message type {}", value.ty().name());
            return Err(Error::TypeMismatch {
                expected: ty.name().to_string(),
                found: value.ty().name().to_string(),
            });
        }

        if value.len() > self.data_len {
            log_err!(
                b,
                "message len too large: is {}, capacity {}",
                value.len(),
                self.data_len
            );
            return Err(Error::InvalidArg("message exceeds data_len".to_string()));
        }

        if !ring.try_push(value.len(), value.bytes()) {
            // DropNew: the new sample is discarded, the counter is
            // published once per change.
            let cnt = self.overruns.fetch_add(1, Ordering::Relaxed) + 1;
            self.publish_overrun(b, cnt);
            log_notice!(b, "buffer overrun [cnt: {cnt}]");
        }

        Ok(())
    }

    fn read(&self, b: &Block, dst: &mut Value) -> Result<usize> {
        let (ring, ty) = self.armed()?;

        if !same_type(dst.ty(), ty) {
            log_err!(b, "invalid message type {}", dst.ty().name());
            return Err(Error::TypeMismatch {
                expected: ty.name().to_string(),
                found: dst.ty().name().to_string(),
            });
        }

        match ring.try_pop(dst.bytes_mut(), ty.size()) {
            None => Ok(0),
            Some((copied, stored)) => {
                if stored > copied {
                    log_err!(b, "only copying {copied} array elements of {stored}");
                }
                Ok(copied)
            }
        }
    }
}

/// Module registering the `cyclic` prototype.
pub struct CyclicMod;

impl Module for CyclicMod {
    fn init(&self, node: &Node) -> Result<()> {
        node.block_register(
            BlockProto::interaction(CYCLIC_PROTO, Cyclic::default)
                .doc("lock-free cyclic buffer for typed in-process communication")
                .config(
                    ConfigSpec::new("type_name", "char")
                        .min(1)
                        .doc("name of registered type to transport"),
                )
                .config(
                    ConfigSpec::new("data_len", "uint32")
                        .max(1)
                        .doc("array length (multiplier) of data (default: 1)"),
                )
                .config(
                    ConfigSpec::new("buffer_len", "uint32")
                        .min(1)
                        .max(1)
                        .doc("max. number of data elements the buffer shall hold"),
                )
                .port(
                    PortSpec::new("overruns")
                        .output("uint64")
                        .doc("number of buffer overruns, written only upon change"),
                ),
        )
    }

    fn cleanup(&self, node: &Node) {
        let _ = node.block_unregister(CYCLIC_PROTO);
    }

    fn license(&self) -> &str {
        "MIT"
    }
}
