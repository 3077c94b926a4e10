use std::sync::Arc;

use super::{Block, BlockState};
use crate::error::{Error, Result};
use crate::types::{DataType, PortableType, Value};

/// A named, typed, length-tagged configuration slot on a block
/// instance.
pub struct Config {
    pub(crate) name: String,
    pub(crate) doc: String,
    pub(crate) ty: Arc<DataType>,
    pub(crate) min: usize,
    pub(crate) max: Option<usize>,
    pub(crate) readonly: bool,
    pub(crate) dynamic: bool,
    pub(crate) value: Option<Value>,
}

impl Config {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> &str {
        &self.doc
    }

    pub fn type_name(&self) -> &str {
        self.ty.name()
    }

    /// Effective length in elements; 0 when unconfigured.
    pub fn len(&self) -> usize {
        self.value.as_ref().map(Value::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this config was added after instantiation.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    fn check_bounds(&self) -> Result<()> {
        let len = self.len();
        if self.min > 0 && len < self.min {
            return Err(Error::InvalidConfig(format!(
                "{}: len {len} < min {}",
                self.name, self.min
            )));
        }
        if let Some(max) = self.max {
            if len > max {
                return Err(Error::InvalidConfig(format!(
                    "{}: len {len} > max {max}",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

impl Block {
    fn with_config<R>(&self, name: &str, f: impl FnOnce(&Config) -> R) -> Result<R> {
        let configs = self.configs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        configs
            .iter()
            .find(|c| c.name == name)
            .map(f)
            .ok_or_else(|| Error::NoSuchEntity(format!("config {name}")))
    }

    fn with_config_mut<R>(&self, name: &str, f: impl FnOnce(&mut Config) -> Result<R>) -> Result<R> {
        let mut configs = self.configs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let config = configs
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::NoSuchEntity(format!("config {name}")))?;
        f(config)
    }

    /// Add a config slot at runtime (used by blocks that derive their
    /// config family from another config, like the trigger's `chainN`).
    pub fn config_add(
        &self,
        name: &str,
        type_name: &str,
        doc: &str,
        min: usize,
        max: Option<usize>,
    ) -> Result<()> {
        let node = self.node().ok_or(Error::InvalidBlock)?;
        let ty = node
            .type_get(type_name)
            .ok_or_else(|| Error::InvalidType(type_name.to_string()))?;

        let mut configs = self.configs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if configs.iter().any(|c| c.name == name) {
            return Err(Error::EntityExists(format!("config {name}")));
        }
        configs.push(Config {
            name: name.to_string(),
            doc: doc.to_string(),
            ty,
            min,
            max,
            readonly: false,
            dynamic: true,
            value: None,
        });
        Ok(())
    }

    /// Assign a value to a config slot.
    ///
    /// The value's type must match the slot's declared type by name and
    /// size. Read-only slots reject assignment once the block has left
    /// `Preinit`.
    pub fn config_set(&self, name: &str, value: Value) -> Result<()> {
        let state = self.state();
        self.with_config_mut(name, |c| {
            if c.readonly && state != BlockState::Preinit {
                return Err(Error::InvalidConfig(format!("{name} is read-only")));
            }
            if value.ty().name() != c.ty.name() || value.ty().size() != c.ty.size() {
                return Err(Error::TypeMismatch {
                    expected: c.ty.name().to_string(),
                    found: value.ty().name().to_string(),
                });
            }
            c.value = Some(value);
            Ok(())
        })
    }

    /// Assign a slice of a portable type.
    pub fn config_set_slice<T: PortableType>(&self, name: &str, data: &[T]) -> Result<()> {
        let ty = self.config_type(name)?;
        self.config_set(name, Value::from_slice(&ty, data)?)
    }

    /// Assign a single element.
    pub fn config_set_scalar<T: PortableType>(&self, name: &str, v: T) -> Result<()> {
        self.config_set_slice(name, std::slice::from_ref(&v))
    }

    /// Assign a string to a `char`-array config.
    pub fn config_set_str(&self, name: &str, s: &str) -> Result<()> {
        let ty = self.config_type(name)?;
        self.config_set(name, Value::from_str(&ty, s)?)
    }

    /// Resolved type of a config slot.
    pub fn config_type(&self, name: &str) -> Result<Arc<DataType>> {
        self.with_config(name, |c| Arc::clone(&c.ty))
    }

    /// Effective length of a config; 0 when unconfigured.
    pub fn config_len(&self, name: &str) -> Result<usize> {
        self.with_config(name, Config::len)
    }

    /// The element of a scalar config slot, `None` when unconfigured
    /// (or configured empty).
    pub fn config_scalar<T: PortableType>(&self, name: &str) -> Result<Option<T>> {
        self.with_config(name, |c| match &c.value {
            Some(v) if v.len() > 1 => Err(Error::InvalidConfigLen(format!(
                "{name}: len {} where scalar expected",
                v.len()
            ))),
            Some(v) if !v.is_empty() => v.scalar::<T>().map(Some),
            _ => Ok(None),
        })?
    }

    /// Copy of the configured slice; empty when unconfigured.
    pub fn config_vec<T: PortableType>(&self, name: &str) -> Result<Vec<T>> {
        self.with_config(name, |c| match &c.value {
            Some(v) => v.as_slice::<T>().map(<[T]>::to_vec),
            None => Ok(Vec::new()),
        })?
    }

    /// String view of a `char`-array config, `None` when unconfigured.
    pub fn config_str(&self, name: &str) -> Result<Option<String>> {
        self.with_config(name, |c| match &c.value {
            Some(v) => v.as_str().map(|s| Some(s.to_string())),
            None => Ok(None),
        })?
    }

    /// Names of all config slots, in declaration order.
    pub fn config_names(&self) -> Vec<String> {
        self.configs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// Walk every config slot and enforce its declared length bounds.
    /// Run before `init` and again before `start` (the latter catches
    /// dynamically added configs).
    pub(crate) fn check_config_bounds(&self) -> Result<()> {
        let configs = self.configs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for c in configs.iter() {
            if let Err(e) = c.check_bounds() {
                crate::log_err!(self, "config check failed: {e}");
                return Err(e);
            }
        }
        Ok(())
    }
}
