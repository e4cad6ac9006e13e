//! Tuning configuration
//!
//! An immutable name-to-parameter mapping with typed lookup. Callers ask for
//! a parameter by name *and* expected kind; a missing name (or a kind
//! mismatch) returns `None` so call sites can default. Construction goes
//! through [`ConfigurationBuilder`], which rejects duplicate names.
//!
//! The recognized option names are centralized in [`names`]; an autotuner
//! replaces values round by round via [`Configuration::replaced_int`], which
//! preserves the parameter's name, kind, and range.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};

use crate::graph::{MachineId, WorkerId};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("parameter `{0}` is already defined")]
    DuplicateParameter(String),
    #[error("sub-configuration `{0}` is already defined")]
    DuplicateSubConfiguration(String),
    #[error("value {value} for `{name}` outside [{min}, {max}]")]
    ValueOutOfRange { name: String, value: i64, min: i64, max: i64 },
    #[error("switch `{name}` selects index {value} from a universe of {universe}")]
    SwitchOutOfRange { name: String, value: usize, universe: usize },
    #[error("parameter `{0}` has a different kind")]
    WrongKind(String),
}

/// Bounded integer parameter.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct IntParameter {
    pub name: String,
    pub min: i64,
    pub max: i64,
    pub value: i64,
}

impl IntParameter {
    pub fn new(name: impl Into<String>, min: i64, max: i64, value: i64) -> Result<Self, ConfigError> {
        let name = name.into();
        if value < min || value > max {
            return Err(ConfigError::ValueOutOfRange { name, value, min, max });
        }
        Ok(Self { name, min, max, value })
    }

    /// Same parameter with a new value; the name and range are kept.
    pub fn with_value(&self, value: i64) -> Result<Self, ConfigError> {
        Self::new(self.name.clone(), self.min, self.max, value)
    }
}

/// Choice from a finite universe, stored as the selected index.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct SwitchParameter {
    pub name: String,
    pub universe: Vec<String>,
    pub value: usize,
}

impl SwitchParameter {
    pub fn new(
        name: impl Into<String>,
        universe: Vec<String>,
        value: usize,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if value >= universe.len() {
            return Err(ConfigError::SwitchOutOfRange { name, value, universe: universe.len() });
        }
        Ok(Self { name, universe, value })
    }

    pub fn selected(&self) -> &str {
        &self.universe[self.value]
    }
}

/// Explicit per-machine blob split: `machines[m]` lists the worker sets that
/// become the blobs of machine `m`, in slot order.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct PartitionParameter {
    pub name: String,
    pub machines: Vec<Vec<BTreeSet<WorkerId>>>,
}

#[derive(Clone, Debug, serde::Serialize)]
pub enum Parameter {
    Int(IntParameter),
    Switch(SwitchParameter),
    Partition(PartitionParameter),
}

impl Parameter {
    pub fn name(&self) -> &str {
        match self {
            Parameter::Int(p) => &p.name,
            Parameter::Switch(p) => &p.name,
            Parameter::Partition(p) => &p.name,
        }
    }
}

/// Recognized option names.
pub mod names {
    use crate::graph::WorkerId;

    /// Steady-state replication factor (>= 1).
    pub const MULTIPLIER: &str = "multiplier";
    /// When present, selects the distributed compilation path.
    pub const NO_OF_MACHINES: &str = "noOfMachines";
    /// Per-blob core-count cap.
    pub const MAX_NUM_CORES: &str = "maxNumCores";
    /// Optional explicit per-machine/blob split.
    pub const PARTITION: &str = "PARTITION";
    /// Back-end private parameters.
    pub const BLOB_CONFIGS: &str = "blobConfigs";

    /// Machine assignment parameter for one worker.
    pub fn worker_to_machine(w: WorkerId) -> String {
        format!("worker{}tomachine", w.as_usize())
    }
}

/// Immutable parameter mapping with optional sub-configurations and opaque
/// extra-data bindings.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct Configuration {
    params: BTreeMap<String, Parameter>,
    subconfigs: BTreeMap<String, Configuration>,
    extras: BTreeMap<String, String>,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    pub fn int_parameter(&self, name: &str) -> Option<&IntParameter> {
        match self.params.get(name) {
            Some(Parameter::Int(p)) => Some(p),
            _ => None,
        }
    }

    pub fn int_value(&self, name: &str) -> Option<i64> {
        self.int_parameter(name).map(|p| p.value)
    }

    pub fn switch_parameter(&self, name: &str) -> Option<&SwitchParameter> {
        match self.params.get(name) {
            Some(Parameter::Switch(p)) => Some(p),
            _ => None,
        }
    }

    pub fn partition_parameter(&self, name: &str) -> Option<&PartitionParameter> {
        match self.params.get(name) {
            Some(Parameter::Partition(p)) => Some(p),
            _ => None,
        }
    }

    pub fn subconfiguration(&self, name: &str) -> Option<&Configuration> {
        self.subconfigs.get(name)
    }

    pub fn extra(&self, name: &str) -> Option<&str> {
        self.extras.get(name).map(String::as_str)
    }

    /// Machine assigned to `w`, defaulting to machine 0 when the parameter is
    /// absent or negative.
    pub fn machine_of(&self, w: WorkerId) -> MachineId {
        let v = self.int_value(&names::worker_to_machine(w)).unwrap_or(0);
        MachineId(v.max(0) as usize)
    }

    /// Steady-state replication factor, clamped to at least 1.
    pub fn multiplier(&self) -> u64 {
        self.int_value(names::MULTIPLIER).unwrap_or(1).max(1) as u64
    }

    /// A copy with `name` replaced by `value`; the parameter's kind, name,
    /// and range are preserved. This is the autotuner's per-round update.
    pub fn replaced_int(&self, name: &str, value: i64) -> Result<Configuration, ConfigError> {
        let current = self
            .int_parameter(name)
            .ok_or_else(|| ConfigError::WrongKind(name.to_string()))?;
        let mut next = self.clone();
        next.params.insert(name.to_string(), Parameter::Int(current.with_value(value)?));
        Ok(next)
    }
}

#[derive(Default, Debug)]
pub struct ConfigurationBuilder {
    params: BTreeMap<String, Parameter>,
    subconfigs: BTreeMap<String, Configuration>,
    extras: BTreeMap<String, String>,
}

impl ConfigurationBuilder {
    pub fn add(mut self, p: Parameter) -> Result<Self, ConfigError> {
        let name = p.name().to_string();
        if self.params.contains_key(&name) {
            return Err(ConfigError::DuplicateParameter(name));
        }
        self.params.insert(name, p);
        Ok(self)
    }

    pub fn add_int(
        self,
        name: impl Into<String>,
        min: i64,
        max: i64,
        value: i64,
    ) -> Result<Self, ConfigError> {
        self.add(Parameter::Int(IntParameter::new(name, min, max, value)?))
    }

    pub fn add_switch(
        self,
        name: impl Into<String>,
        universe: Vec<String>,
        value: usize,
    ) -> Result<Self, ConfigError> {
        self.add(Parameter::Switch(SwitchParameter::new(name, universe, value)?))
    }

    pub fn add_subconfiguration(
        mut self,
        name: impl Into<String>,
        sub: Configuration,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if self.subconfigs.contains_key(&name) {
            return Err(ConfigError::DuplicateSubConfiguration(name));
        }
        self.subconfigs.insert(name, sub);
        Ok(self)
    }

    pub fn add_extra(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Configuration {
        Configuration { params: self.params, subconfigs: self.subconfigs, extras: self.extras }
    }
}

/// Convenience: assignment of every listed worker to one machine, plus a
/// multiplier. The usual starting point for tests and the demo binary.
pub fn single_machine(workers: usize, multiplier: i64) -> Configuration {
    let mut b = Configuration::builder()
        .add_int(names::MULTIPLIER, 1, i64::MAX, multiplier)
        .expect("fresh builder");
    for w in 0..workers {
        b = b
            .add_int(names::worker_to_machine(WorkerId(w)), 0, i64::MAX, 0)
            .expect("worker names are distinct");
    }
    b.build()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_duplicate_names() {
        let b = Configuration::builder().add_int("multiplier", 1, 16, 4).unwrap();
        let err = b.add_int("multiplier", 1, 16, 2).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateParameter(_)));
    }

    #[test]
    fn typed_lookup_defaults_on_missing_or_mismatched() {
        let cfg = Configuration::builder()
            .add_switch("fusion", vec!["none".into(), "full".into()], 1)
            .unwrap()
            .build();
        assert!(cfg.int_parameter("fusion").is_none());
        assert!(cfg.int_value("absent").is_none());
        assert_eq!(cfg.switch_parameter("fusion").unwrap().selected(), "full");
        assert_eq!(cfg.multiplier(), 1);
    }

    #[test]
    fn replacement_preserves_kind_name_and_range() {
        let cfg = Configuration::builder().add_int("multiplier", 1, 16, 4).unwrap().build();
        let next = cfg.replaced_int("multiplier", 8).unwrap();
        let p = next.int_parameter("multiplier").unwrap();
        assert_eq!(p.name, "multiplier");
        assert_eq!((p.min, p.max, p.value), (1, 16, 8));
        assert!(matches!(
            cfg.replaced_int("multiplier", 99),
            Err(ConfigError::ValueOutOfRange { .. })
        ));
        assert!(matches!(cfg.replaced_int("absent", 1), Err(ConfigError::WrongKind(_))));
    }

    #[test]
    fn worker_machine_defaults_to_zero() {
        let cfg = single_machine(3, 2);
        assert_eq!(cfg.machine_of(WorkerId(1)), MachineId(0));
        assert_eq!(cfg.multiplier(), 2);
        assert_eq!(cfg.machine_of(WorkerId(17)), MachineId(0)); // absent -> default
    }

    #[test]
    fn int_parameter_validates_range() {
        assert!(matches!(
            IntParameter::new("x", 0, 4, 9),
            Err(ConfigError::ValueOutOfRange { .. })
        ));
    }
}
