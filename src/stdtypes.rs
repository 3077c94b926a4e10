//! The `stdtypes` module: basic scalar types plus the core struct types
//! used by the trigger machinery. Load this before any module whose
//! prototypes declare these types.

use crate::error::Result;
use crate::module::Module;
use crate::node::Node;
use crate::trigger::{Triggee, Tstat};
use crate::types::DataType;

fn descriptors() -> Vec<DataType> {
    vec![
        DataType::basic::<u8>(),
        DataType::basic::<i8>(),
        DataType::basic::<u16>(),
        DataType::basic::<i16>(),
        DataType::basic::<u32>(),
        DataType::basic::<i32>(),
        DataType::basic::<u64>(),
        DataType::basic::<i64>(),
        DataType::basic::<f32>(),
        DataType::basic::<f64>(),
        DataType::basic::<usize>(),
        DataType::structure::<Tstat>(),
        DataType::structure::<Triggee>(),
    ]
}

pub struct StdTypes;

impl Module for StdTypes {
    fn init(&self, node: &Node) -> Result<()> {
        let mut registered: Vec<String> = Vec::new();
        for ty in descriptors() {
            let name = ty.name().to_string();
            if let Err(e) = node.type_register(ty) {
                // Leave the node unchanged on failure.
                for name in registered {
                    let _ = node.type_unregister(&name);
                }
                return Err(e);
            }
            registered.push(name);
        }
        Ok(())
    }

    fn cleanup(&self, node: &Node) {
        for ty in descriptors() {
            let _ = node.type_unregister(ty.name());
        }
    }

    fn license(&self) -> &str {
        "BSD-3-Clause"
    }
}
