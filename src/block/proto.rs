use super::{BlockKind, Computation, Interaction};

/// Config slot declaration on a prototype.
#[derive(Clone, Debug)]
pub struct ConfigSpec {
    pub(crate) name: String,
    pub(crate) type_name: String,
    pub(crate) doc: String,
    pub(crate) min: usize,
    pub(crate) max: Option<usize>,
    pub(crate) readonly: bool,
}

impl ConfigSpec {
    pub fn new(name: &str, type_name: &str) -> ConfigSpec {
        ConfigSpec {
            name: name.to_string(),
            type_name: type_name.to_string(),
            doc: String::new(),
            min: 0,
            max: None,
            readonly: false,
        }
    }

    pub fn doc(mut self, doc: &str) -> ConfigSpec {
        self.doc = doc.to_string();
        self
    }

    /// Minimum array length; a non-zero minimum makes the config
    /// mandatory before `init`.
    pub fn min(mut self, min: usize) -> ConfigSpec {
        self.min = min;
        self
    }

    /// Maximum array length.
    pub fn max(mut self, max: usize) -> ConfigSpec {
        self.max = Some(max);
        self
    }

    /// Reject assignment once the instance has left `Preinit`.
    pub fn readonly(mut self) -> ConfigSpec {
        self.readonly = true;
        self
    }
}

/// Port declaration on a prototype.
///
/// The direction follows from which type names are declared: an input
/// type makes the port readable, an output type writable, both make it
/// bidirectional.
#[derive(Clone, Debug)]
pub struct PortSpec {
    pub(crate) name: String,
    pub(crate) doc: String,
    pub(crate) in_type_name: Option<String>,
    pub(crate) out_type_name: Option<String>,
    pub(crate) in_data_len: usize,
    pub(crate) out_data_len: usize,
}

impl PortSpec {
    pub fn new(name: &str) -> PortSpec {
        PortSpec {
            name: name.to_string(),
            doc: String::new(),
            in_type_name: None,
            out_type_name: None,
            in_data_len: 1,
            out_data_len: 1,
        }
    }

    pub fn doc(mut self, doc: &str) -> PortSpec {
        self.doc = doc.to_string();
        self
    }

    pub fn input(mut self, type_name: &str) -> PortSpec {
        self.in_type_name = Some(type_name.to_string());
        self
    }

    pub fn output(mut self, type_name: &str) -> PortSpec {
        self.out_type_name = Some(type_name.to_string());
        self
    }

    /// Array multiplier of the input side (default 1).
    pub fn in_data_len(mut self, len: usize) -> PortSpec {
        self.in_data_len = len;
        self
    }

    /// Array multiplier of the output side (default 1).
    pub fn out_data_len(mut self, len: usize) -> PortSpec {
        self.out_data_len = len;
        self
    }
}

pub(crate) enum Factory {
    Computation(Box<dyn Fn() -> Box<dyn Computation> + Send + Sync>),
    Interaction(Box<dyn Fn() -> Box<dyn Interaction> + Send + Sync>),
}

/// An immutable block schema registered on a node.
///
/// Instances are produced by [`crate::node::Node::block_create`], which
/// copies the port and config declarations into fresh owning storage and
/// calls the factory for a fresh implementation object.
pub struct BlockProto {
    pub(crate) name: String,
    pub(crate) doc: String,
    pub(crate) trigger: bool,
    pub(crate) configs: Vec<ConfigSpec>,
    pub(crate) ports: Vec<PortSpec>,
    pub(crate) factory: Factory,
}

impl BlockProto {
    /// A computation prototype; `make` produces the per-instance
    /// implementation.
    pub fn computation<T, F>(name: &str, make: F) -> BlockProto
    where
        T: Computation + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        BlockProto {
            name: name.to_string(),
            doc: String::new(),
            trigger: false,
            configs: Vec::new(),
            ports: Vec::new(),
            factory: Factory::Computation(Box::new(move || Box::new(make()))),
        }
    }

    /// An interaction prototype.
    pub fn interaction<T, F>(name: &str, make: F) -> BlockProto
    where
        T: Interaction + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        BlockProto {
            name: name.to_string(),
            doc: String::new(),
            trigger: false,
            configs: Vec::new(),
            ports: Vec::new(),
            factory: Factory::Interaction(Box::new(move || Box::new(make()))),
        }
    }

    pub fn doc(mut self, doc: &str) -> BlockProto {
        self.doc = doc.to_string();
        self
    }

    /// Mark instances as triggers (blocks that step other blocks).
    pub fn trigger(mut self) -> BlockProto {
        self.trigger = true;
        self
    }

    pub fn config(mut self, spec: ConfigSpec) -> BlockProto {
        self.configs.push(spec);
        self
    }

    pub fn port(mut self, spec: PortSpec) -> BlockProto {
        self.ports.push(spec);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BlockKind {
        match self.factory {
            Factory::Computation(_) => BlockKind::Computation,
            Factory::Interaction(_) => BlockKind::Interaction,
        }
    }

    /// Names of every type the prototype's ports and configs declare.
    pub(crate) fn declared_type_names(&self) -> impl Iterator<Item = &str> {
        self.ports
            .iter()
            .flat_map(|p| {
                p.in_type_name
                    .as_deref()
                    .into_iter()
                    .chain(p.out_type_name.as_deref())
            })
            .chain(self.configs.iter().map(|c| c.type_name.as_str()))
    }
}
