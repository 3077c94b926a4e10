//! The module capability.
//!
//! A module is the unit of deployment for types and block prototypes:
//! loading it registers them with a node, unloading deregisters exactly
//! what it registered. Whether the implementation behind this trait is
//! statically linked or loaded from a shared library is a deployment
//! choice the kernel does not care about.

use crate::error::Result;
use crate::node::Node;

pub trait Module: Send {
    /// Register this module's types and prototypes with `node`.
    ///
    /// On failure the node must be left unchanged: either register
    /// nothing, or roll back what was registered before the failure.
    fn init(&self, node: &Node) -> Result<()>;

    /// Deregister everything [`init`](Self::init) registered.
    fn cleanup(&self, node: &Node);

    /// SPDX license identifier of the module.
    fn license(&self) -> &str;
}
