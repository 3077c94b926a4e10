//! The synchronous trigger block.
//!
//! `trig` carries no activity of its own: each step fires its chains on
//! the caller's thread, in chain order. Use it to compose sub-schedules
//! that a periodic trigger then drives as a single target.

use super::{configure_chains, init_chains, trigger_configs, write_profiles, Chain};
use crate::block::{Block, BlockProto, Computation, PortSpec};
use crate::error::Result;
use crate::module::Module;
use crate::node::Node;
use crate::trigger::Tstat;
use crate::types::PortableType;

/// Prototype name registered by [`TrigMod`].
pub const TRIG_PROTO: &str = "trig";

#[derive(Default)]
pub struct Trig {
    num_chains: usize,
    chains: Vec<Chain>,
}

impl Computation for Trig {
    fn init(&mut self, b: &Block) -> Result<()> {
        self.num_chains = init_chains(b)?;
        Ok(())
    }

    fn start(&mut self, b: &Block) -> Result<()> {
        self.chains = configure_chains(b, self.num_chains)?;
        for chain in &mut self.chains {
            chain.arm();
        }
        Ok(())
    }

    fn step(&mut self, b: &Block) -> Result<()> {
        let mut ret = Ok(());
        for chain in &mut self.chains {
            if let Err(e) = chain.trigger(b) {
                ret = Err(e);
            }
        }
        ret
    }

    fn stop(&mut self, b: &Block) {
        for chain in &self.chains {
            chain.log_all(b);
        }
        write_profiles(b, &self.chains);
    }
}

/// Module registering the `trig` prototype. Requires the `stdtypes`
/// module (for the scalar, `tstat` and `triggee` types).
pub struct TrigMod;

impl Module for TrigMod {
    fn init(&self, node: &Node) -> Result<()> {
        let mut proto = BlockProto::computation(TRIG_PROTO, Trig::default)
            .doc("synchronous trigger: steps its chains on the caller's thread")
            .trigger()
            .port(
                PortSpec::new("tstats")
                    .output(Tstat::TYPE_NAME)
                    .doc("per-chain and per-block timing statistics"),
            );
        for spec in trigger_configs() {
            proto = proto.config(spec);
        }
        node.block_register(proto)
    }

    fn cleanup(&self, node: &Node) {
        let _ = node.block_unregister(TRIG_PROTO);
    }

    fn license(&self) -> &str {
        "MIT"
    }
}
