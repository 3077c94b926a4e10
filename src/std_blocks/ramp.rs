//! Ramp generator blocks.
//!
//! Each step adds `slope` to the accumulator and writes it to the `out`
//! port. Registered for `double` and `int` payloads; mostly useful as a
//! signal source in compositions and tests.

use std::ops::AddAssign;
use std::sync::Arc;

use crate::block::{Block, BlockProto, Computation, ConfigSpec, Port, PortSpec};
use crate::error::{Error, Result};
use crate::module::Module;
use crate::node::Node;
use crate::types::{PortableType, Value};

pub const RAMP_DOUBLE_PROTO: &str = "ramp_double";
pub const RAMP_INT_PROTO: &str = "ramp_int";

/// Payload types a ramp can count in.
pub trait RampNum: PortableType + Default + AddAssign + Send + 'static {
    fn one() -> Self;
}

impl RampNum for f64 {
    fn one() -> f64 {
        1.0
    }
}

impl RampNum for i32 {
    fn one() -> i32 {
        1
    }
}

#[derive(Default)]
pub struct Ramp<T: RampNum> {
    cur: T,
    slope: T,
    out: Option<(Arc<Port>, Value)>,
}

impl<T: RampNum> Computation for Ramp<T> {
    fn start(&mut self, b: &Block) -> Result<()> {
        self.cur = b.config_scalar::<T>("start")?.unwrap_or_default();
        self.slope = b.config_scalar::<T>("slope")?.unwrap_or_else(T::one);

        let node = b.node().ok_or(Error::InvalidBlock)?;
        let ty = node
            .type_get(T::TYPE_NAME)
            .ok_or_else(|| Error::InvalidType(T::TYPE_NAME.to_string()))?;
        self.out = Some((b.port("out")?, Value::new(&ty, 1)));
        Ok(())
    }

    fn step(&mut self, _b: &Block) -> Result<()> {
        self.cur += self.slope;
        let (port, val) = self.out.as_mut().ok_or(Error::InvalidBlock)?;
        val.set_scalar(self.cur)?;
        port.write(val)
    }
}

fn proto<T: RampNum>(name: &str) -> BlockProto {
    BlockProto::computation(name, Ramp::<T>::default)
        .doc("ramp generator")
        .config(
            ConfigSpec::new("start", T::TYPE_NAME)
                .max(1)
                .doc("ramp starting value (default 0)"),
        )
        .config(
            ConfigSpec::new("slope", T::TYPE_NAME)
                .max(1)
                .doc("rate of change (default 1)"),
        )
        .port(
            PortSpec::new("out")
                .output(T::TYPE_NAME)
                .doc("ramp generator output"),
        )
}

/// Module registering the ramp prototypes. Requires `stdtypes`.
pub struct RampMod;

impl Module for RampMod {
    fn init(&self, node: &Node) -> Result<()> {
        node.block_register(proto::<f64>(RAMP_DOUBLE_PROTO))?;
        if let Err(e) = node.block_register(proto::<i32>(RAMP_INT_PROTO)) {
            let _ = node.block_unregister(RAMP_DOUBLE_PROTO);
            return Err(e);
        }
        Ok(())
    }

    fn cleanup(&self, node: &Node) {
        let _ = node.block_unregister(RAMP_DOUBLE_PROTO);
        let _ = node.block_unregister(RAMP_INT_PROTO);
    }

    fn license(&self) -> &str {
        "MIT"
    }
}

#[cfg(test)]
mod test {
    use crate::block::connect_uni;
    use crate::block::PortSpec;
    use crate::testutil::{cyclic_block, io_block, node_with_std};

    #[test]
    fn test_ramp_double_counts_up() {
        let node = node_with_std("t-ramp");
        let ramp = node.block_create(super::RAMP_DOUBLE_PROTO, "r1").unwrap();
        ramp.config_set_scalar::<f64>("start", 1.0).unwrap();
        ramp.config_set_scalar::<f64>("slope", 0.5).unwrap();

        let fifo = cyclic_block(&node, "fifo", "double", 1, 8);
        let sink = io_block(&node, "sink", vec![PortSpec::new("in").input("double")]);
        ramp.init().unwrap();
        connect_uni(
            &ramp.port("out").unwrap(),
            &sink.port("in").unwrap(),
            &fifo,
        )
        .unwrap();
        ramp.start().unwrap();

        for _ in 0..3 {
            ramp.step().unwrap();
        }
        assert_eq!(ramp.step_count(), 3);

        let inp = sink.port("in").unwrap();
        for expect in [1.5, 2.0, 2.5] {
            assert_eq!(inp.read_scalar::<f64>().unwrap(), Some(expect));
        }
        assert_eq!(inp.read_scalar::<f64>().unwrap(), None);
    }

    #[test]
    fn test_ramp_int_defaults() {
        let node = node_with_std("t-ramp-int");
        let ramp = node.block_create(super::RAMP_INT_PROTO, "r1").unwrap();
        let fifo = cyclic_block(&node, "fifo", "int", 1, 8);
        let sink = io_block(&node, "sink", vec![PortSpec::new("in").input("int")]);
        ramp.init().unwrap();
        connect_uni(
            &ramp.port("out").unwrap(),
            &sink.port("in").unwrap(),
            &fifo,
        )
        .unwrap();
        ramp.start().unwrap();

        // Defaults: start 0, slope 1.
        ramp.step().unwrap();
        ramp.step().unwrap();
        let inp = sink.port("in").unwrap();
        assert_eq!(inp.read_scalar::<i32>().unwrap(), Some(1));
        assert_eq!(inp.read_scalar::<i32>().unwrap(), Some(2));
    }
}
