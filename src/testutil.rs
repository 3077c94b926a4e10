//! Shared helpers for the in-crate tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::block::{Block, BlockProto, Computation, Interaction, PortSpec};
use crate::cyclic::CyclicMod;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::ptrig::PtrigMod;
use crate::std_blocks::ramp::RampMod;
use crate::stdtypes::StdTypes;
use crate::trigger::TrigMod;
use crate::types::Value;

/// A node with the standard modules loaded.
pub(crate) fn node_with_std(name: &str) -> Arc<Node> {
    let node = Node::init(name).unwrap();
    node.module_load("stdtypes", Box::new(StdTypes)).unwrap();
    node.module_load("cyclic", Box::new(CyclicMod)).unwrap();
    node.module_load("ramp", Box::new(RampMod)).unwrap();
    node.module_load("trig", Box::new(TrigMod)).unwrap();
    node.module_load("ptrig", Box::new(PtrigMod)).unwrap();
    node
}

/// Computation that counts its steps, optionally failing each one.
pub(crate) struct StepCounter {
    steps: Arc<AtomicU64>,
    fail: bool,
}

impl Computation for StepCounter {
    fn step(&mut self, _b: &Block) -> Result<()> {
        if self.fail {
            return Err(Error::InvalidArg("intentional step failure".to_string()));
        }
        self.steps.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Register a counting proto and create a started instance.
pub(crate) fn counter_block(node: &Arc<Node>, name: &str) -> (Arc<Block>, Arc<AtomicU64>) {
    let steps = Arc::new(AtomicU64::new(0));
    let factory_steps = Arc::clone(&steps);
    node.block_register(BlockProto::computation(
        &format!("{name}_proto"),
        move || StepCounter {
            steps: Arc::clone(&factory_steps),
            fail: false,
        },
    ))
    .unwrap();
    let b = node.block_create(&format!("{name}_proto"), name).unwrap();
    b.init().unwrap();
    b.start().unwrap();
    (b, steps)
}

/// Register a proto whose steps always fail and create a started
/// instance.
pub(crate) fn failing_block(node: &Arc<Node>, name: &str) -> Arc<Block> {
    node.block_register(BlockProto::computation(
        &format!("{name}_proto"),
        || StepCounter {
            steps: Arc::new(AtomicU64::new(0)),
            fail: true,
        },
    ))
    .unwrap();
    let b = node.block_create(&format!("{name}_proto"), name).unwrap();
    b.init().unwrap();
    b.start().unwrap();
    b
}

/// Observable state of a [`Latch`] interaction.
#[derive(Default)]
pub(crate) struct LatchState {
    pub writes: AtomicU64,
    pub last: Mutex<Option<Value>>,
}

impl LatchState {
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn last_scalar<T: crate::types::PortableType>(&self) -> Option<T> {
        let last = self.last.lock().unwrap();
        last.as_ref().and_then(|v| v.scalar::<T>().ok())
    }
}

/// Trivial single-slot interaction remembering the last written value.
pub(crate) struct Latch {
    state: Arc<LatchState>,
}

impl Interaction for Latch {
    fn read(&self, _b: &Block, _dst: &mut Value) -> Result<usize> {
        Ok(0)
    }

    fn write(&self, _b: &Block, value: &Value) -> Result<()> {
        self.state.writes.fetch_add(1, Ordering::Relaxed);
        *self.state.last.lock().unwrap() = Some(value.clone());
        Ok(())
    }
}

/// Register a latch proto and create a started instance.
pub(crate) fn latch_block(node: &Arc<Node>, name: &str) -> (Arc<Block>, Arc<LatchState>) {
    let state = Arc::new(LatchState::default());
    let factory_state = Arc::clone(&state);
    node.block_register(BlockProto::interaction(
        &format!("{name}_proto"),
        move || Latch {
            state: Arc::clone(&factory_state),
        },
    ))
    .unwrap();
    let b = node.block_create(&format!("{name}_proto"), name).unwrap();
    b.init().unwrap();
    b.start().unwrap();
    (b, state)
}

/// No-op computation used as a port carrier.
pub(crate) struct Passthrough;

impl Computation for Passthrough {
    fn step(&mut self, _b: &Block) -> Result<()> {
        Ok(())
    }
}

/// Register a proto with the given ports and create an instance of it
/// (left in `Preinit`; ports are usable from creation on).
pub(crate) fn io_block(node: &Arc<Node>, name: &str, ports: Vec<PortSpec>) -> Arc<Block> {
    let mut proto = BlockProto::computation(&format!("{name}_proto"), || Passthrough);
    for p in ports {
        proto = proto.port(p);
    }
    node.block_register(proto).unwrap();
    node.block_create(&format!("{name}_proto"), name).unwrap()
}

/// A started cyclic buffer instance.
pub(crate) fn cyclic_block(
    node: &Arc<Node>,
    name: &str,
    type_name: &str,
    data_len: u32,
    buffer_len: u32,
) -> Arc<Block> {
    let b = node.block_create(crate::cyclic::CYCLIC_PROTO, name).unwrap();
    b.config_set_str("type_name", type_name).unwrap();
    b.config_set_scalar::<u32>("data_len", data_len).unwrap();
    b.config_set_scalar::<u32>("buffer_len", buffer_len).unwrap();
    b.init().unwrap();
    b.start().unwrap();
    b
}
