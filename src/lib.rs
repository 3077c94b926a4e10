//! A realtime-safe runtime for typed function-block composition.
//!
//! A [`node`](node::Node) is a process-scoped registry of modules,
//! types and blocks. *Computation* blocks expose a `step` operation and
//! are driven by triggers; *interaction* blocks expose `read`/`write`
//! and carry samples between block ports. The canonical interaction is
//! a lock-free single-producer/single-consumer ring
//! ([`cyclic`](cyclic::Cyclic)); the canonical driver is a periodic
//! trigger thread ticking to absolute monotonic deadlines
//! ([`ptrig`](ptrig::Ptrig)), optionally under `SCHED_FIFO`/`SCHED_RR`.
//! Log records flow through a shared-memory ring ([`rtlog`]) that the
//! `blockrt-log` companion binary tails from outside the process.
//!
//! ## Example
//!
//! Drive a ramp generator into a custom consumer at 100 Hz:
//!
//! ```no_run
//! use blockrt::block::{connect_uni, Block, BlockProto, Computation, PortSpec};
//! use blockrt::cyclic::CyclicMod;
//! use blockrt::node::Node;
//! use blockrt::ptrig::{Period, PtrigMod};
//! use blockrt::std_blocks::ramp::RampMod;
//! use blockrt::stdtypes::StdTypes;
//! use blockrt::trigger::Triggee;
//!
//! #[derive(Default)]
//! struct Printer;
//!
//! impl Computation for Printer {
//!     fn step(&mut self, b: &Block) -> blockrt::error::Result<()> {
//!         if let Some(v) = b.port("in")?.read_scalar::<f64>()? {
//!             println!("sample: {v}");
//!         }
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> blockrt::error::Result<()> {
//!     let node = Node::init("demo")?;
//!     node.module_load("stdtypes", Box::new(StdTypes))?;
//!     node.module_load("cyclic", Box::new(CyclicMod))?;
//!     node.module_load("ramp", Box::new(RampMod))?;
//!     node.module_load("ptrig", Box::new(PtrigMod))?;
//!     node.block_register(
//!         BlockProto::computation("printer", Printer::default)
//!             .port(PortSpec::new("in").input("double")),
//!     )?;
//!
//!     let ramp = node.block_create("ramp_double", "r1")?;
//!     let printer = node.block_create("printer", "p1")?;
//!     let fifo = node.block_create("cyclic", "fifo1")?;
//!
//!     ramp.config_set_scalar::<f64>("slope", 0.5)?;
//!     fifo.config_set_str("type_name", "double")?;
//!     fifo.config_set_scalar::<u32>("buffer_len", 8)?;
//!
//!     let trig = node.block_create("ptrig", "trig1")?;
//!     trig.config_set_scalar("period", Period { sec: 0, usec: 10_000 })?;
//!     // chainN configs appear at init, derived from num_chains.
//!     trig.init()?;
//!     trig.config_set_slice(
//!         "chain0",
//!         &[Triggee::new("r1", 1, 0)?, Triggee::new("p1", 1, 0)?],
//!     )?;
//!
//!     for b in [&ramp, &printer, &fifo] {
//!         b.init()?;
//!     }
//!     connect_uni(&*ramp.port("out")?, &*printer.port("in")?, &fifo)?;
//!
//!     for b in [&fifo, &ramp, &printer, &trig] {
//!         b.start()?;
//!     }
//!
//!     std::thread::sleep(std::time::Duration::from_secs(1));
//!
//!     trig.stop()?;
//!     node.cleanup();
//!     Ok(())
//! }
//! ```
//!
//! ## Ownership
//!
//! Ownership is strictly tree-shaped: the node owns its blocks, blocks
//! own their ports and configs, types are borrowed from the node's
//! registry. Port-to-interaction bindings are weak references; an
//! interaction must outlive the bindings that name it.

pub mod block;
pub mod cyclic;
pub mod error;
mod ffi;
pub mod module;
pub mod node;
pub mod ptrig;
pub mod rtlog;
pub mod std_blocks;
pub mod stdtypes;
pub mod time;
pub mod trigger;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;
