//! The node: a process-scoped registry of modules, types and blocks.
//!
//! A node owns everything in a composition: loaded modules, registered
//! types, block prototypes and live instances, plus the log sink every
//! block emits through. Registries are keyed by name and preserve
//! insertion order, which makes the teardown walk in
//! [`Node::cleanup`] deterministic.
//!
//! Registries are mutated during construction, teardown and module
//! load/unload only; the stepping hot path never touches them. Callers
//! must quiesce the composition before restructuring it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;

use crate::block::{Block, BlockProto, BlockState, Config};
use crate::error::{Error, Result};
use crate::module::Module;
use crate::rtlog::{record_now, Level, LogRecord, LogSink, Loggable, LOG_SHM_FILENAME};
use crate::types::{DataType, PortableType, Value};
use crate::{log_dbg, log_err, log_info, log_warn};


struct TypeEntry {
    ty: Arc<DataType>,
    seqid: u64,
}

enum NodeBlock {
    Proto(Arc<BlockProto>),
    Instance(Arc<Block>),
}

#[derive(Default)]
struct Registries {
    modules: IndexMap<String, Box<dyn Module>>,
    types: IndexMap<String, TypeEntry>,
    blocks: IndexMap<String, NodeBlock>,
    next_seqid: u64,
}

/// A process-scoped registry of modules, types and blocks.
pub struct Node {
    name: String,
    loglevel: AtomicI32,
    sink: LogSink,
    reg: Mutex<Registries>,
    torn_down: AtomicBool,
}

impl Node {
    /// Create a fresh, empty node.
    ///
    /// This also brings up the realtime log sink: the shared-memory
    /// ring is created here and unlinked again at node teardown. If the
    /// shm cannot be created (no `/dev/shm`, permissions), logging
    /// falls back to stderr rather than failing the node.
    pub fn init(name: &str) -> Result<Arc<Node>> {
        if name.is_empty() {
            return Err(Error::InvalidArg("empty node name".to_string()));
        }

        let sink = match crate::rtlog::shm::LogWriter::create(LOG_SHM_FILENAME) {
            Ok(writer) => LogSink::Shm(writer),
            Err(e) => {
                eprintln!("{name}: failed to create log shm ({e}), logging to stderr");
                LogSink::Stderr
            }
        };

        let node = Arc::new(Node {
            name: name.to_string(),
            loglevel: AtomicI32::new(Level::default() as i32),
            sink,
            reg: Mutex::new(Registries::default()),
            torn_down: AtomicBool::new(false),
        });

        log_info!(node, "node {name} initialized");
        Ok(node)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node-wide log level; blocks without an override inherit it.
    pub fn loglevel(&self) -> Level {
        Level::from_i32(self.loglevel.load(Ordering::Relaxed)).unwrap_or_default()
    }

    pub fn set_loglevel(&self, level: Level) {
        self.loglevel.store(level as i32, Ordering::Relaxed);
    }

    pub(crate) fn sink_write(&self, rec: &LogRecord) {
        self.sink.write(rec);
    }

    fn reg(&self) -> MutexGuard<'_, Registries> {
        self.reg.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /*
     * modules
     */

    /// Load a module: run its init hook and record it under `id`.
    ///
    /// A failing init leaves the node unchanged (the module contract
    /// requires init to roll back its own partial registrations).
    pub fn module_load(&self, id: &str, module: Box<dyn Module>) -> Result<()> {
        if self.reg().modules.contains_key(id) {
            return Err(Error::AlreadyLoaded(id.to_string()));
        }

        if let Err(e) = module.init(self) {
            log_err!(self, "module {id} init failed: {e}");
            return Err(Error::ModuleInitFailed(id.to_string()));
        }

        log_info!(self, "loaded module {id} ({})", module.license());
        self.reg().modules.insert(id.to_string(), module);
        Ok(())
    }

    /// Unload a module: remove it and run its cleanup hook.
    pub fn module_unload(&self, id: &str) -> Result<()> {
        let module = self
            .reg()
            .modules
            .shift_remove(id)
            .ok_or_else(|| Error::NoSuchEntity(format!("module {id}")))?;

        module.cleanup(self);
        log_dbg!(self, "unloaded module {id}");
        Ok(())
    }

    pub fn num_modules(&self) -> usize {
        self.reg().modules.len()
    }

    /*
     * types
     */

    /// Register a type descriptor. Names are unique per node; the
    /// descriptor's registration sequence id orders types for external
    /// introspection.
    pub fn type_register(&self, ty: DataType) -> Result<Arc<DataType>> {
        if ty.size() == 0 {
            return Err(Error::InvalidType(format!("{}: zero size", ty.name())));
        }

        let mut reg = self.reg();
        if reg.types.contains_key(ty.name()) {
            log_err!(self, "type {} already registered", ty.name());
            return Err(Error::AlreadyRegistered(ty.name().to_string()));
        }

        let seqid = reg.next_seqid;
        reg.next_seqid += 1;

        let ty = Arc::new(ty);
        reg.types.insert(
            ty.name().to_string(),
            TypeEntry {
                ty: Arc::clone(&ty),
                seqid,
            },
        );
        Ok(ty)
    }

    /// Remove a type from the registry.
    ///
    /// Blocks still holding the handle keep it alive; that situation is
    /// reported as a leak diagnostic at teardown, not an error here.
    pub fn type_unregister(&self, name: &str) -> Result<Arc<DataType>> {
        let entry = self
            .reg()
            .types
            .shift_remove(name)
            .ok_or_else(|| Error::NoSuchEntity(format!("type {name}")))?;
        Ok(entry.ty)
    }

    pub fn type_get(&self, name: &str) -> Option<Arc<DataType>> {
        self.reg().types.get(name).map(|e| Arc::clone(&e.ty))
    }

    /// All registered types in registration (seqid) order.
    pub fn types(&self) -> Vec<Arc<DataType>> {
        let reg = self.reg();
        let mut entries: Vec<_> = reg.types.values().collect();
        entries.sort_by_key(|e| e.seqid);
        entries.iter().map(|e| Arc::clone(&e.ty)).collect()
    }

    pub fn num_types(&self) -> usize {
        self.reg().types.len()
    }

    /// A fresh value of the basic type `T` maps to.
    pub fn new_value<T: PortableType>(&self, data: &[T]) -> Result<Value> {
        let ty = self
            .type_get(T::TYPE_NAME)
            .ok_or_else(|| Error::InvalidType(T::TYPE_NAME.to_string()))?;
        Value::from_slice(&ty, data)
    }

    /// A fresh `char`-array value holding `s`.
    pub fn new_value_str(&self, s: &str) -> Result<Value> {
        let ty = self
            .type_get(u8::TYPE_NAME)
            .ok_or_else(|| Error::InvalidType(u8::TYPE_NAME.to_string()))?;
        Value::from_str(&ty, s)
    }

    /*
     * blocks
     */

    /// Register a block prototype.
    ///
    /// Every type name the prototype's ports and configs declare must
    /// already be registered; an unresolved name fails registration.
    pub fn block_register(&self, proto: BlockProto) -> Result<()> {
        let mut reg = self.reg();

        for name in proto.declared_type_names() {
            if !reg.types.contains_key(name) {
                log_err!(self, "proto {}: unresolved type {name}", proto.name());
                return Err(Error::InvalidType(name.to_string()));
            }
        }

        if reg.blocks.contains_key(proto.name()) {
            return Err(Error::EntityExists(proto.name().to_string()));
        }

        reg.blocks
            .insert(proto.name().to_string(), NodeBlock::Proto(Arc::new(proto)));
        Ok(())
    }

    /// Remove a prototype (or a leftover instance) from the registry by
    /// name. Used by module cleanup hooks.
    pub fn block_unregister(&self, name: &str) -> Result<()> {
        self.reg()
            .blocks
            .shift_remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NoSuchEntity(format!("block {name}")))
    }

    /// Clone the prototype `proto_name` into a fresh instance.
    ///
    /// The new block starts in `Preinit` with its own port and config
    /// storage; all declared type names are resolved to live handles
    /// here, so an instance can only exist with fully resolved ports.
    /// Every instance also carries a kernel-provided `loglevel` config,
    /// which requires the `int` type to be registered.
    pub fn block_create(self: &Arc<Self>, proto_name: &str, name: &str) -> Result<Arc<Block>> {
        let proto = {
            let reg = self.reg();
            let proto = match reg.blocks.get(proto_name) {
                Some(NodeBlock::Proto(p)) => Arc::clone(p),
                Some(NodeBlock::Instance(_)) => return Err(Error::InvalidBlockType),
                None => return Err(Error::NoSuchEntity(format!("prototype {proto_name}"))),
            };
            if reg.blocks.contains_key(name) {
                return Err(Error::EntityExists(name.to_string()));
            }
            proto
        };

        let block = self.instantiate(&proto, name)?;

        let mut reg = self.reg();
        if reg.blocks.contains_key(name) {
            return Err(Error::EntityExists(name.to_string()));
        }
        reg.blocks
            .insert(name.to_string(), NodeBlock::Instance(Arc::clone(&block)));

        log_dbg!(self, "created block {name} (proto {proto_name})");
        Ok(block)
    }

    fn instantiate(self: &Arc<Self>, proto: &BlockProto, name: &str) -> Result<Arc<Block>> {
        let resolve = |type_name: &str| {
            self.type_get(type_name)
                .ok_or_else(|| Error::InvalidType(type_name.to_string()))
        };

        let mut ports = Vec::with_capacity(proto.ports.len());
        for spec in &proto.ports {
            let in_ty = spec.in_type_name.as_deref().map(resolve).transpose()?;
            let out_ty = spec.out_type_name.as_deref().map(resolve).transpose()?;
            ports.push(crate::block::port_seed(spec, in_ty, out_ty));
        }

        let mut configs = Vec::with_capacity(proto.configs.len() + 1);
        for spec in &proto.configs {
            configs.push(Config {
                name: spec.name.clone(),
                doc: spec.doc.clone(),
                ty: resolve(&spec.type_name)?,
                min: spec.min,
                max: spec.max,
                readonly: spec.readonly,
                dynamic: false,
                value: None,
            });
        }

        // Every instance carries the kernel-provided loglevel override.
        if !proto.configs.iter().any(|c| c.name == "loglevel") {
            configs.push(Config {
                name: "loglevel".to_string(),
                doc: "per-block log level override".to_string(),
                ty: resolve(i32::TYPE_NAME)?,
                min: 0,
                max: Some(1),
                readonly: false,
                dynamic: false,
                value: None,
            });
        }

        let ops = crate::block::ops_from_factory(&proto.factory);

        Ok(Block::build(
            self,
            name,
            &proto.doc,
            proto.name(),
            proto.trigger,
            ports,
            configs,
            ops,
        ))
    }

    /// Look up a live instance by name.
    pub fn block_get(&self, name: &str) -> Result<Arc<Block>> {
        match self.reg().blocks.get(name) {
            Some(NodeBlock::Instance(b)) => Ok(Arc::clone(b)),
            Some(NodeBlock::Proto(_)) => Err(Error::InvalidBlockType),
            None => Err(Error::NoSuchEntity(format!("block {name}"))),
        }
    }

    /// Remove an instance. The block must be back in `Preinit`
    /// (i.e. cleaned up).
    pub fn block_rm(&self, name: &str) -> Result<()> {
        let mut reg = self.reg();
        match reg.blocks.get(name) {
            Some(NodeBlock::Instance(b)) => {
                let state = b.state();
                if state != BlockState::Preinit {
                    return Err(Error::WrongState {
                        op: "block_rm",
                        expected: BlockState::Preinit,
                        found: state,
                    });
                }
                reg.blocks.shift_remove(name);
                Ok(())
            }
            Some(NodeBlock::Proto(_)) => Err(Error::InvalidBlockType),
            None => Err(Error::NoSuchEntity(format!("block {name}"))),
        }
    }

    /// All live instances in registration order.
    pub fn blocks(&self) -> Vec<Arc<Block>> {
        self.reg()
            .blocks
            .values()
            .filter_map(|e| match e {
                NodeBlock::Instance(b) => Some(Arc::clone(b)),
                NodeBlock::Proto(_) => None,
            })
            .collect()
    }

    /// Number of registered blocks (prototypes and instances).
    pub fn num_blocks(&self) -> usize {
        self.reg().blocks.len()
    }

    /*
     * teardown
     */

    /// Tear the node down: stop every active block, clean up every
    /// inactive one, remove all instances, then unload the modules in
    /// reverse registration order.
    ///
    /// Whatever survives all four steps points at a module cleanup bug
    /// and is logged as a warning; it cannot leak into a later node in
    /// the same process because this node owns it.
    pub fn cleanup(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let instances = self.blocks();

        for b in instances.iter().filter(|b| b.state() == BlockState::Active) {
            log_dbg!(self, "stopping block {}", b.name());
            if b.stop().is_err() {
                log_err!(self, "failed to stop block {}", b.name());
            }
        }

        for b in instances
            .iter()
            .filter(|b| b.state() == BlockState::Inactive)
        {
            log_dbg!(self, "cleaning up block {}", b.name());
            if b.cleanup().is_err() {
                log_err!(self, "failed to cleanup block {}", b.name());
            }
        }

        for b in instances.iter().filter(|b| b.state() == BlockState::Preinit) {
            log_dbg!(self, "removing block {}", b.name());
            if let Err(e) = self.block_rm(b.name()) {
                log_err!(self, "block_rm {} failed: {e}", b.name());
            }
        }

        let module_ids: Vec<String> = self.reg().modules.keys().rev().cloned().collect();
        for id in module_ids {
            if let Err(e) = self.module_unload(&id) {
                log_err!(self, "unloading module {id} failed: {e}");
            }
        }

        let leftover_types = self.num_types();
        if leftover_types > 0 {
            log_warn!(self, "{leftover_types} types after cleanup");
        }
        let leftover_blocks = self.num_blocks();
        if leftover_blocks > 0 {
            log_warn!(self, "{leftover_blocks} blocks after cleanup");
        }
        let leftover_modules = self.num_modules();
        if leftover_modules > 0 {
            log_warn!(self, "{leftover_modules} modules after cleanup");
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl Loggable for Node {
    fn loglevel(&self) -> Level {
        Node::loglevel(self)
    }

    fn emit_record(&self, level: Level, args: fmt::Arguments<'_>) {
        self.sink.write(&record_now(level, &self.name, args));
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("blocks", &self.num_blocks())
            .field("types", &self.num_types())
            .field("modules", &self.num_modules())
            .finish()
    }
}
