//! The block model: computation and interaction blocks, their lifecycle,
//! ports and configuration slots.
//!
//! Blocks are produced by cloning a [`BlockProto`] registered on a node
//! (see [`crate::node::Node::block_create`]). An instance starts in
//! `Preinit` and moves along the strict line graph
//! `Preinit -> Inactive -> Active` (and back) through
//! [`Block::init`]/[`Block::start`]/[`Block::stop`]/[`Block::cleanup`].
//! Skipping a state is a [`WrongState`](crate::error::Error::WrongState)
//! failure and a failing user hook leaves the state unchanged.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

pub use config::Config;
pub use port::{connect_uni, disconnect_uni, Port, PortDir};
pub use proto::{BlockProto, ConfigSpec, PortSpec};

use crate::error::{Error, Result};
use crate::node::Node;
use crate::rtlog::{record_now, Level, LogSink, Loggable};
use crate::types::Value;
use crate::{log_dbg, log_err};

mod config;
mod port;
mod proto;


/// Upper bound on block instance names; longer names would truncate in
/// log records and trigger chain entries.
pub const BLOCK_NAME_MAXLEN: usize = 30;

/// Lifecycle state of a block instance.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BlockState {
    Preinit = 0,
    Inactive = 1,
    Active = 2,
}

impl BlockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockState::Preinit => "preinit",
            BlockState::Inactive => "inactive",
            BlockState::Active => "active",
        }
    }

    fn from_u8(v: u8) -> BlockState {
        match v {
            0 => BlockState::Preinit,
            1 => BlockState::Inactive,
            _ => BlockState::Active,
        }
    }
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a block: stepped computation or read/write interaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BlockKind {
    Computation,
    Interaction,
}

/// Hooks of a computation block.
///
/// One instance of the implementing type backs one block instance; the
/// kernel serialises all calls (lifecycle from the owning thread, `step`
/// from the single stepping thread) behind a mutex, so hooks take
/// `&mut self` and may keep plain private state.
pub trait Computation: Send {
    fn init(&mut self, b: &Block) -> Result<()> {
        let _ = b;
        Ok(())
    }

    fn start(&mut self, b: &Block) -> Result<()> {
        let _ = b;
        Ok(())
    }

    fn stop(&mut self, b: &Block) {
        let _ = b;
    }

    fn cleanup(&mut self, b: &Block) {
        let _ = b;
    }

    /// One computation step. Called only while the block is `Active`.
    fn step(&mut self, b: &Block) -> Result<()>;
}

/// Hooks of an interaction block.
///
/// `read` and `write` run concurrently from the producer and consumer
/// side and therefore take `&self`; implementations keep their hot-path
/// state in atomics. Lifecycle hooks take `&mut self` — the kernel holds
/// the exclusive side of a read/write lock for those, which is free to
/// take because transitions only happen while the composition is
/// quiesced.
pub trait Interaction: Send + Sync {
    fn init(&mut self, b: &Block) -> Result<()> {
        let _ = b;
        Ok(())
    }

    fn start(&mut self, b: &Block) -> Result<()> {
        let _ = b;
        Ok(())
    }

    fn stop(&mut self, b: &Block) {
        let _ = b;
    }

    fn cleanup(&mut self, b: &Block) {
        let _ = b;
    }

    /// Pull the oldest unread sample into `dst`; returns the number of
    /// elements delivered, 0 when no data is available.
    fn read(&self, b: &Block, dst: &mut Value) -> Result<usize>;

    /// Push one sample.
    fn write(&self, b: &Block, value: &Value) -> Result<()>;
}

pub(crate) enum BlockOps {
    Computation {
        imp: Mutex<Box<dyn Computation>>,
        step_count: AtomicU64,
    },
    Interaction {
        imp: RwLock<Box<dyn Interaction>>,
        read_count: AtomicU64,
        write_count: AtomicU64,
    },
}

/// A live block instance, owned by its node.
pub struct Block {
    name: String,
    doc: String,
    prototype: String,
    trigger: bool,
    node: Weak<Node>,
    self_ref: Weak<Block>,
    state: AtomicU8,
    // -1: no override, use the node-wide level.
    loglevel: AtomicI32,
    ports: Vec<Arc<Port>>,
    configs: Mutex<Vec<Config>>,
    ops: BlockOps,
}

impl Block {
    pub(crate) fn build(
        node: &Arc<Node>,
        name: &str,
        doc: &str,
        prototype: &str,
        trigger: bool,
        ports: Vec<port::PortSeed>,
        configs: Vec<Config>,
        ops: BlockOps,
    ) -> Arc<Block> {
        Arc::new_cyclic(|self_ref| {
            let ports = ports
                .into_iter()
                .map(|seed| Arc::new(seed.into_port(self_ref.clone())))
                .collect();

            Block {
                name: name.to_string(),
                doc: doc.to_string(),
                prototype: prototype.to_string(),
                trigger,
                node: Arc::downgrade(node),
                self_ref: self_ref.clone(),
                state: AtomicU8::new(BlockState::Preinit as u8),
                loglevel: AtomicI32::new(-1),
                ports,
                configs: Mutex::new(configs),
                ops,
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> &str {
        &self.doc
    }

    /// Name of the prototype this instance was cloned from.
    pub fn prototype(&self) -> &str {
        &self.prototype
    }

    /// Whether this block drives other blocks (set by trigger protos).
    pub fn is_trigger(&self) -> bool {
        self.trigger
    }

    pub fn kind(&self) -> BlockKind {
        match self.ops {
            BlockOps::Computation { .. } => BlockKind::Computation,
            BlockOps::Interaction { .. } => BlockKind::Interaction,
        }
    }

    pub fn state(&self) -> BlockState {
        BlockState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: BlockState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn node(&self) -> Option<Arc<Node>> {
        self.node.upgrade()
    }

    pub(crate) fn weak(&self) -> Weak<Block> {
        self.self_ref.clone()
    }

    /// Look up a port by name.
    pub fn port(&self, name: &str) -> Result<Arc<Port>> {
        self.ports
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| Error::NoSuchEntity(format!("port {name}")))
    }

    pub fn ports(&self) -> &[Arc<Port>] {
        &self.ports
    }

    fn expect_state(&self, op: &'static str, expected: BlockState) -> Result<()> {
        let found = self.state();
        if found != expected {
            log_err!(self, "{op}: not in state {expected} (but {found})");
            return Err(Error::WrongState {
                op,
                expected,
                found,
            });
        }
        Ok(())
    }

    /// Initialise the block: `Preinit -> Inactive`.
    ///
    /// Checks config length bounds, applies a `loglevel` config override
    /// if one is set, then runs the implementation's init hook. On hook
    /// failure the block stays in `Preinit`.
    pub fn init(&self) -> Result<()> {
        self.expect_state("init", BlockState::Preinit)?;
        self.apply_loglevel();
        self.check_config_bounds()?;

        let result = match &self.ops {
            BlockOps::Computation { imp, .. } => lock(imp).init(self),
            BlockOps::Interaction { imp, .. } => write(imp).init(self),
        };
        if let Err(e) = result {
            log_err!(self, "init failed: {e}");
            return Err(e);
        }

        self.set_state(BlockState::Inactive);
        Ok(())
    }

    /// Start the block: `Inactive -> Active`.
    ///
    /// Re-checks config bounds (dynamically added configs are validated
    /// at this boundary) before the start hook runs.
    pub fn start(&self) -> Result<()> {
        self.expect_state("start", BlockState::Inactive)?;
        self.check_config_bounds()?;

        let result = match &self.ops {
            BlockOps::Computation { imp, .. } => lock(imp).start(self),
            BlockOps::Interaction { imp, .. } => write(imp).start(self),
        };
        if let Err(e) = result {
            log_err!(self, "start failed: {e}");
            return Err(e);
        }

        self.set_state(BlockState::Active);
        Ok(())
    }

    /// Stop the block: `Active -> Inactive`.
    pub fn stop(&self) -> Result<()> {
        self.expect_state("stop", BlockState::Active)?;

        match &self.ops {
            BlockOps::Computation { imp, .. } => lock(imp).stop(self),
            BlockOps::Interaction { imp, .. } => write(imp).stop(self),
        }

        self.set_state(BlockState::Inactive);
        Ok(())
    }

    /// Clean up the block: `Inactive -> Preinit`.
    pub fn cleanup(&self) -> Result<()> {
        self.expect_state("cleanup", BlockState::Inactive)?;

        match &self.ops {
            BlockOps::Computation { imp, .. } => lock(imp).cleanup(self),
            BlockOps::Interaction { imp, .. } => write(imp).cleanup(self),
        }

        self.set_state(BlockState::Preinit);
        Ok(())
    }

    /// Step a computation block once.
    pub fn step(&self) -> Result<()> {
        let BlockOps::Computation { imp, step_count } = &self.ops else {
            log_err!(self, "step: not a computation block");
            return Err(Error::InvalidBlockType);
        };

        let state = self.state();
        if state != BlockState::Active {
            log_err!(self, "step: block not active");
            return Err(Error::WrongState {
                op: "step",
                expected: BlockState::Active,
                found: state,
            });
        }

        lock(imp).step(self)?;
        step_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of successful steps of a computation block.
    pub fn step_count(&self) -> u64 {
        match &self.ops {
            BlockOps::Computation { step_count, .. } => step_count.load(Ordering::Relaxed),
            BlockOps::Interaction { .. } => 0,
        }
    }

    /// Number of successful (data-yielding) reads of an interaction.
    pub fn read_count(&self) -> u64 {
        match &self.ops {
            BlockOps::Interaction { read_count, .. } => read_count.load(Ordering::Relaxed),
            BlockOps::Computation { .. } => 0,
        }
    }

    /// Number of successful writes of an interaction.
    pub fn write_count(&self) -> u64 {
        match &self.ops {
            BlockOps::Interaction { write_count, .. } => write_count.load(Ordering::Relaxed),
            BlockOps::Computation { .. } => 0,
        }
    }

    pub(crate) fn interaction_read(&self, dst: &mut Value) -> Result<usize> {
        let BlockOps::Interaction {
            imp, read_count, ..
        } = &self.ops
        else {
            return Err(Error::InvalidBlockType);
        };

        let n = read(imp).read(self, dst)?;
        if n > 0 {
            read_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(n)
    }

    pub(crate) fn interaction_write(&self, value: &Value) -> Result<()> {
        let BlockOps::Interaction {
            imp, write_count, ..
        } = &self.ops
        else {
            return Err(Error::InvalidBlockType);
        };

        read(imp).write(self, value)?;
        write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn apply_loglevel(&self) {
        match self.config_scalar::<i32>("loglevel") {
            Ok(Some(v)) if Level::from_i32(v).is_some() => {
                log_dbg!(self, "using loglevel config ({v})");
                self.loglevel.store(v, Ordering::Relaxed);
            }
            Ok(Some(v)) => log_err!(self, "invalid loglevel config {v}"),
            _ => (),
        }
    }
}

impl Loggable for Block {
    fn loglevel(&self) -> Level {
        match self.loglevel.load(Ordering::Relaxed) {
            -1 => self
                .node
                .upgrade()
                .map(|n| n.loglevel())
                .unwrap_or_default(),
            v => Level::from_i32(v).unwrap_or_default(),
        }
    }

    fn emit_record(&self, level: Level, args: fmt::Arguments<'_>) {
        let rec = record_now(level, &self.name, args);
        match self.node.upgrade() {
            Some(node) => node.sink_write(&rec),
            None => LogSink::Stderr.write(&rec),
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("prototype", &self.prototype)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

pub(crate) fn ops_from_factory(factory: &proto::Factory) -> BlockOps {
    match factory {
        proto::Factory::Computation(make) => BlockOps::Computation {
            imp: Mutex::new(make()),
            step_count: AtomicU64::new(0),
        },
        proto::Factory::Interaction(make) => BlockOps::Interaction {
            imp: RwLock::new(make()),
            read_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
        },
    }
}

pub(crate) fn port_seed(
    spec: &PortSpec,
    in_ty: Option<Arc<crate::types::DataType>>,
    out_ty: Option<Arc<crate::types::DataType>>,
) -> port::PortSeed {
    port::PortSeed {
        name: spec.name.clone(),
        doc: spec.doc.clone(),
        in_type_name: spec.in_type_name.clone(),
        out_type_name: spec.out_type_name.clone(),
        in_data_len: spec.in_data_len,
        out_data_len: spec.out_data_len,
        in_ty,
        out_ty,
    }
}

// Lock helpers that survive a panicking hook: the protected state is
// the block implementation itself, which stays usable for teardown.
pub(crate) fn lock<T: ?Sized>(m: &Mutex<Box<T>>) -> MutexGuard<'_, Box<T>> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T: ?Sized>(l: &RwLock<Box<T>>) -> RwLockReadGuard<'_, Box<T>> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T: ?Sized>(l: &RwLock<Box<T>>) -> RwLockWriteGuard<'_, Box<T>> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
