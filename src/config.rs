//! Sectioned, typed, multivalue configuration store.
//!
//! Options are declared up front (`opt_add`) with a type and help text;
//! values arrive from a YAML file, `GANTRY_*` environment variables, or
//! programmatic sets, and are read back with typed getters. Plugins
//! declare their own options in their `register` entry point before the
//! server finishes startup, after which the store is shared read-only.

use std::collections::HashMap;
use std::env;

use crate::errors::ConfigError;

/// Section holding the server's own options.
pub const CORE_SECTION: &str = "core";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    Int,
    Str,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    fn kind(&self) -> ParamKind {
        match self {
            Value::Bool(_) => ParamKind::Bool,
            Value::Int(_) => ParamKind::Int,
            Value::Str(_) => ParamKind::Str,
        }
    }
}

#[derive(Debug)]
struct OptionSlot {
    kind: ParamKind,
    #[allow(dead_code)]
    help: String,
    multivalued: bool,
    default: Option<Value>,
    values: Vec<Value>,
}

#[derive(Debug, Default)]
pub struct Config {
    sections: HashMap<String, HashMap<String, OptionSlot>>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares one option. Redeclaring an existing option is an error.
    pub fn opt_add(
        &mut self,
        section: &str,
        name: &str,
        kind: ParamKind,
        help: &str,
    ) -> Result<(), ConfigError> {
        let slots = self.sections.entry(section.to_string()).or_default();
        if slots.contains_key(name) {
            return Err(ConfigError::DuplicateOption {
                section: section.to_string(),
                name: name.to_string(),
            });
        }
        slots.insert(
            name.to_string(),
            OptionSlot {
                kind,
                help: help.to_string(),
                multivalued: false,
                default: None,
                values: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn set_multivalued(
        &mut self,
        section: &str,
        name: &str,
        flag: bool,
    ) -> Result<(), ConfigError> {
        self.slot_mut(section, name)?.multivalued = flag;
        Ok(())
    }

    pub fn set_default(
        &mut self,
        section: &str,
        name: &str,
        value: Value,
    ) -> Result<(), ConfigError> {
        let slot = self.slot_mut(section, name)?;
        if slot.kind != value.kind() {
            return Err(ConfigError::TypeMismatch {
                section: section.to_string(),
                name: name.to_string(),
            });
        }
        slot.default = Some(value);
        Ok(())
    }

    /// Replaces the option's values with one value.
    pub fn set(&mut self, section: &str, name: &str, value: Value) -> Result<(), ConfigError> {
        let slot = self.slot_mut(section, name)?;
        if slot.kind != value.kind() {
            return Err(ConfigError::TypeMismatch {
                section: section.to_string(),
                name: name.to_string(),
            });
        }
        slot.values.clear();
        slot.values.push(value);
        Ok(())
    }

    /// Appends one value; only multivalued options can hold more than one.
    pub fn push(&mut self, section: &str, name: &str, value: Value) -> Result<(), ConfigError> {
        let slot = self.slot_mut(section, name)?;
        if slot.kind != value.kind() {
            return Err(ConfigError::TypeMismatch {
                section: section.to_string(),
                name: name.to_string(),
            });
        }
        if !slot.multivalued && !slot.values.is_empty() {
            return Err(ConfigError::NotMultivalued {
                section: section.to_string(),
                name: name.to_string(),
            });
        }
        slot.values.push(value);
        Ok(())
    }

    /// Number of explicit values; a default alone counts as one.
    pub fn num_values(&self, section: &str, name: &str) -> Result<usize, ConfigError> {
        let slot = self.slot(section, name)?;
        if slot.values.is_empty() {
            Ok(usize::from(slot.default.is_some()))
        } else {
            Ok(slot.values.len())
        }
    }

    pub fn get_nth(&self, section: &str, name: &str, index: usize) -> Result<&Value, ConfigError> {
        let slot = self.slot(section, name)?;
        match slot.values.get(index) {
            Some(value) => Ok(value),
            None if index == 0 => slot.default.as_ref().ok_or(ConfigError::Missing {
                section: section.to_string(),
                name: name.to_string(),
                index,
            }),
            None => Err(ConfigError::Missing {
                section: section.to_string(),
                name: name.to_string(),
                index,
            }),
        }
    }

    pub fn get_nth_str(
        &self,
        section: &str,
        name: &str,
        index: usize,
    ) -> Result<&str, ConfigError> {
        match self.get_nth(section, name, index)? {
            Value::Str(s) => Ok(s),
            _ => Err(self.mismatch(section, name)),
        }
    }

    pub fn get_nth_int(
        &self,
        section: &str,
        name: &str,
        index: usize,
    ) -> Result<i64, ConfigError> {
        match self.get_nth(section, name, index)? {
            Value::Int(i) => Ok(*i),
            _ => Err(self.mismatch(section, name)),
        }
    }

    pub fn get_nth_bool(
        &self,
        section: &str,
        name: &str,
        index: usize,
    ) -> Result<bool, ConfigError> {
        match self.get_nth(section, name, index)? {
            Value::Bool(b) => Ok(*b),
            _ => Err(self.mismatch(section, name)),
        }
    }

    pub fn get_str(&self, section: &str, name: &str) -> Result<&str, ConfigError> {
        self.get_nth_str(section, name, 0)
    }

    pub fn get_int(&self, section: &str, name: &str) -> Result<i64, ConfigError> {
        self.get_nth_int(section, name, 0)
    }

    pub fn get_bool(&self, section: &str, name: &str) -> Result<bool, ConfigError> {
        self.get_nth_bool(section, name, 0)
    }

    /// Loads values from YAML text shaped as `section: {name: value}`.
    /// Every option must have been declared; sequences require the
    /// option to be multivalued.
    pub fn load_yaml_str(&mut self, text: &str) -> Result<(), ConfigError> {
        let doc: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let serde_yaml::Value::Mapping(sections) = doc else {
            return Err(ConfigError::Parse("top level must be a mapping".into()));
        };

        for (section_key, body) in sections {
            let section = yaml_key(&section_key)?;
            let serde_yaml::Value::Mapping(entries) = body else {
                return Err(ConfigError::Parse(format!(
                    "section {section} must be a mapping"
                )));
            };
            for (name_key, value) in entries {
                let name = yaml_key(&name_key)?;
                match value {
                    serde_yaml::Value::Sequence(items) => {
                        for item in items {
                            let value = self.coerce(&section, &name, &item)?;
                            self.push(&section, &name, value)?;
                        }
                    }
                    item => {
                        let value = self.coerce(&section, &name, &item)?;
                        self.set(&section, &name, value)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies `GANTRY_<SECTION>_<NAME>` environment overrides to every
    /// declared option.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        let mut overrides = Vec::new();
        for (section, slots) in &self.sections {
            for (name, slot) in slots {
                let var = format!(
                    "GANTRY_{}_{}",
                    section.to_uppercase().replace('-', "_"),
                    name.to_uppercase().replace('-', "_")
                );
                if let Ok(raw) = env::var(&var) {
                    let value = parse_typed(slot.kind, &raw).ok_or_else(|| {
                        ConfigError::TypeMismatch {
                            section: section.clone(),
                            name: name.clone(),
                        }
                    })?;
                    overrides.push((section.clone(), name.clone(), value));
                }
            }
        }
        for (section, name, value) in overrides {
            self.set(&section, &name, value)?;
        }
        Ok(())
    }

    fn coerce(
        &self,
        section: &str,
        name: &str,
        value: &serde_yaml::Value,
    ) -> Result<Value, ConfigError> {
        let kind = self.slot(section, name)?.kind;
        let coerced = match (kind, value) {
            (ParamKind::Bool, serde_yaml::Value::Bool(b)) => Some(Value::Bool(*b)),
            (ParamKind::Int, serde_yaml::Value::Number(n)) => n.as_i64().map(Value::Int),
            (ParamKind::Str, serde_yaml::Value::String(s)) => Some(Value::Str(s.clone())),
            _ => None,
        };
        coerced.ok_or_else(|| ConfigError::TypeMismatch {
            section: section.to_string(),
            name: name.to_string(),
        })
    }

    fn slot(&self, section: &str, name: &str) -> Result<&OptionSlot, ConfigError> {
        self.sections
            .get(section)
            .and_then(|slots| slots.get(name))
            .ok_or_else(|| ConfigError::UnknownOption {
                section: section.to_string(),
                name: name.to_string(),
            })
    }

    fn slot_mut(&mut self, section: &str, name: &str) -> Result<&mut OptionSlot, ConfigError> {
        self.sections
            .get_mut(section)
            .and_then(|slots| slots.get_mut(name))
            .ok_or_else(|| ConfigError::UnknownOption {
                section: section.to_string(),
                name: name.to_string(),
            })
    }

    fn mismatch(&self, section: &str, name: &str) -> ConfigError {
        ConfigError::TypeMismatch {
            section: section.to_string(),
            name: name.to_string(),
        }
    }
}

fn yaml_key(key: &serde_yaml::Value) -> Result<String, ConfigError> {
    match key {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        other => Err(ConfigError::Parse(format!("non-string key {other:?}"))),
    }
}

fn parse_typed(kind: ParamKind, raw: &str) -> Option<Value> {
    match kind {
        ParamKind::Bool => match raw {
            "1" | "true" | "yes" | "on" => Some(Value::Bool(true)),
            "0" | "false" | "no" | "off" => Some(Value::Bool(false)),
            _ => None,
        },
        ParamKind::Int => raw.parse().ok().map(Value::Int),
        ParamKind::Str => Some(Value::Str(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        let mut config = Config::new();
        config
            .opt_add(CORE_SECTION, "address", ParamKind::Str, "listen address")
            .unwrap();
        config
            .opt_add(CORE_SECTION, "port", ParamKind::Int, "listen port")
            .unwrap();
        config
            .opt_add("hello", "greeting", ParamKind::Str, "response body")
            .unwrap();
        config
            .opt_add("hello", "aliases", ParamKind::Str, "extra routes")
            .unwrap();
        config.set_multivalued("hello", "aliases", true).unwrap();
        config
    }

    #[test]
    fn defaults_and_overrides() {
        let mut config = base();
        config
            .set_default(CORE_SECTION, "port", Value::Int(8000))
            .unwrap();

        assert_eq!(config.get_int(CORE_SECTION, "port").unwrap(), 8000);
        assert_eq!(config.num_values(CORE_SECTION, "port").unwrap(), 1);

        config.set(CORE_SECTION, "port", Value::Int(9000)).unwrap();
        assert_eq!(config.get_int(CORE_SECTION, "port").unwrap(), 9000);
    }

    #[test]
    fn multivalue_access() {
        let mut config = base();
        config
            .push("hello", "aliases", Value::Str("/hi".into()))
            .unwrap();
        config
            .push("hello", "aliases", Value::Str("/hey".into()))
            .unwrap();

        assert_eq!(config.num_values("hello", "aliases").unwrap(), 2);
        assert_eq!(config.get_nth_str("hello", "aliases", 0).unwrap(), "/hi");
        assert_eq!(config.get_nth_str("hello", "aliases", 1).unwrap(), "/hey");
        assert!(matches!(
            config.get_nth_str("hello", "aliases", 2),
            Err(ConfigError::Missing { index: 2, .. })
        ));
    }

    #[test]
    fn single_valued_options_refuse_a_second_push() {
        let mut config = base();
        config
            .push("hello", "greeting", Value::Str("hi".into()))
            .unwrap();
        assert!(matches!(
            config.push("hello", "greeting", Value::Str("again".into())),
            Err(ConfigError::NotMultivalued { .. })
        ));
    }

    #[test]
    fn unknown_options_and_type_mismatches_are_rejected() {
        let mut config = base();
        assert!(matches!(
            config.set("nope", "missing", Value::Int(1)),
            Err(ConfigError::UnknownOption { .. })
        ));
        assert!(matches!(
            config.set(CORE_SECTION, "port", Value::Str("eighty".into())),
            Err(ConfigError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn yaml_loading() {
        let mut config = base();
        config
            .load_yaml_str(
                "core:\n  address: 0.0.0.0\n  port: 8080\nhello:\n  aliases: [/hi, /hey]\n",
            )
            .unwrap();

        assert_eq!(config.get_str(CORE_SECTION, "address").unwrap(), "0.0.0.0");
        assert_eq!(config.get_int(CORE_SECTION, "port").unwrap(), 8080);
        assert_eq!(config.num_values("hello", "aliases").unwrap(), 2);

        assert!(config.load_yaml_str("core:\n  bogus: 1\n").is_err());
        assert!(config.load_yaml_str("core:\n  port: not-a-number\n").is_err());
    }

    #[test]
    fn env_overrides() {
        let mut config = base();
        std::env::set_var("GANTRY_CORE_PORT", "7070");
        config.apply_env().unwrap();
        std::env::remove_var("GANTRY_CORE_PORT");

        assert_eq!(config.get_int(CORE_SECTION, "port").unwrap(), 7070);
    }
}
