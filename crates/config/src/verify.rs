//! Schema descriptions for configuration verification.
//!
//! A [`Schema`] mirrors the shape of a configuration tree: a set of
//! [`KeyRule`]s for the block's own keys and nested schemas for its
//! sub-blocks. Verification walks the tree once, applying defaults and
//! collecting every violation rather than stopping at the first.

use crate::configuration::{Configuration, MULTI_VALUE_SEPARATOR};

/// Expected type of a key's value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    /// Any string.
    Any,
    /// Must parse as a signed integer.
    Int,
    /// Must parse as `yes`/`true`/`no`/`false`.
    Bool,
}

/// Verification rule for a single key.
#[derive(Clone, Debug)]
pub struct KeyRule {
    name: &'static str,
    kind: ValueKind,
    required: bool,
    multi_value: bool,
    default: Option<&'static str>,
}

impl KeyRule {
    /// A key that must be present.
    #[must_use]
    pub const fn required(name: &'static str, kind: ValueKind) -> Self {
        Self {
            name,
            kind,
            required: true,
            multi_value: false,
            default: None,
        }
    }

    /// A key that may be absent.
    #[must_use]
    pub const fn optional(name: &'static str, kind: ValueKind) -> Self {
        Self {
            name,
            kind,
            required: false,
            multi_value: false,
            default: None,
        }
    }

    /// A key that is filled in with `default` when absent.
    #[must_use]
    pub const fn with_default(name: &'static str, kind: ValueKind, default: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            multi_value: false,
            default: Some(default),
        }
    }

    /// Permits the key to appear multiple times.
    #[must_use]
    pub const fn multi(mut self) -> Self {
        self.multi_value = true;
        self
    }
}

/// Which sub-blocks a block may contain.
#[derive(Clone, Debug)]
pub enum SubBlocks {
    /// No sub-blocks allowed.
    None,
    /// Named sub-blocks, each with its own schema. Absent named blocks are
    /// an error only when marked required.
    Named(Vec<(&'static str, bool, Schema)>),
    /// Any number of sub-blocks with arbitrary names, all sharing one
    /// schema (the RAID disc-set list uses this).
    AnyName(Box<Schema>),
}

/// Schema for one configuration block.
#[derive(Clone, Debug)]
pub struct Schema {
    keys: Vec<KeyRule>,
    sub_blocks: SubBlocks,
}

impl Schema {
    /// Creates a schema from key rules and a sub-block policy.
    #[must_use]
    pub const fn new(keys: Vec<KeyRule>, sub_blocks: SubBlocks) -> Self {
        Self { keys, sub_blocks }
    }

    /// Verifies `config` against this schema, pushing human-readable
    /// problems (prefixed with `level`, the dotted block path) into `out`.
    /// Defaults are applied as a side effect.
    pub fn verify(&self, config: &mut Configuration, level: &str, out: &mut Vec<String>) {
        for rule in &self.keys {
            match config.raw_key(rule.name) {
                Some(value) => {
                    if !rule.multi_value && value.contains(MULTI_VALUE_SEPARATOR) {
                        out.push(format!(
                            "{level}{} is specified more than once",
                            rule.name
                        ));
                        continue;
                    }
                    for single in value.split(MULTI_VALUE_SEPARATOR) {
                        check_kind(rule, single, level, out);
                    }
                }
                None => {
                    if let Some(default) = rule.default {
                        config.insert_default(rule.name, default);
                    } else if rule.required {
                        out.push(format!("{level}{} is not set", rule.name));
                    }
                }
            }
        }

        // Unknown keys are an error: a misspelt key must not be silently
        // ignored.
        for name in config.key_names() {
            if !self.keys.iter().any(|rule| rule.name == name) {
                out.push(format!("{level}{name} is not a known key"));
            }
        }

        match &self.sub_blocks {
            SubBlocks::None => {
                for (name, _) in config.sub_blocks() {
                    out.push(format!("{level}{name} is not a known sub-block"));
                }
            }
            SubBlocks::Named(named) => {
                for (name, required, _) in named {
                    if *required && !config.sub_block_exists(name) {
                        out.push(format!("{level}{name} block is missing"));
                    }
                }
                let named = named.clone();
                for (name, sub) in config.sub_blocks_mut() {
                    match named.iter().find(|(n, _, _)| *n == name) {
                        Some((_, _, schema)) => {
                            let sub_level = format!("{level}{name}.");
                            schema.verify(sub, &sub_level, out);
                        }
                        None => out.push(format!("{level}{name} is not a known sub-block")),
                    }
                }
            }
            SubBlocks::AnyName(schema) => {
                let schema = schema.clone();
                for (name, sub) in config.sub_blocks_mut() {
                    let sub_level = format!("{level}{name}.");
                    schema.verify(sub, &sub_level, out);
                }
            }
        }
    }
}

fn check_kind(rule: &KeyRule, value: &str, level: &str, out: &mut Vec<String>) {
    match rule.kind {
        ValueKind::Any => {}
        ValueKind::Int => {
            if value.parse::<i64>().is_err() {
                out.push(format!(
                    "{level}{} is not a valid integer: {value:?}",
                    rule.name
                ));
            }
        }
        ValueKind::Bool => {
            if !matches!(
                value.to_ascii_lowercase().as_str(),
                "yes" | "true" | "no" | "false"
            ) {
                out.push(format!(
                    "{level}{} is not a valid boolean: {value:?}",
                    rule.name
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(
            vec![
                KeyRule::required("AccountDatabase", ValueKind::Any),
                KeyRule::with_default("TimeBetweenHousekeeping", ValueKind::Int, "900"),
            ],
            SubBlocks::Named(vec![(
                "Server",
                true,
                Schema::new(
                    vec![
                        KeyRule::required("ListenAddresses", ValueKind::Any).multi(),
                        KeyRule::optional("MaximumRefusedConnections", ValueKind::Int),
                    ],
                    SubBlocks::None,
                ),
            )]),
        )
    }

    #[test]
    fn valid_config_passes_and_gets_defaults() {
        let mut config = Configuration::parse(
            "AccountDatabase = /x\nServer\n{\nListenAddresses = inet:1.2.3.4:99\n}\n",
        )
        .unwrap();
        let mut problems = Vec::new();
        schema().verify(&mut config, "", &mut problems);
        assert!(problems.is_empty(), "{problems:?}");
        assert_eq!(
            config.key_value_int("TimeBetweenHousekeeping").unwrap(),
            900
        );
    }

    #[test]
    fn missing_required_key_and_block_are_both_reported() {
        let mut config = Configuration::parse("").unwrap();
        let mut problems = Vec::new();
        schema().verify(&mut config, "", &mut problems);
        assert!(problems.iter().any(|p| p.contains("AccountDatabase")));
        assert!(problems.iter().any(|p| p.contains("Server block")));
    }

    #[test]
    fn unknown_key_is_an_error() {
        let mut config = Configuration::parse(
            "AccountDatabase = /x\nAcountDatabase = /y\nServer\n{\nListenAddresses = a\n}\n",
        )
        .unwrap();
        let mut problems = Vec::new();
        schema().verify(&mut config, "", &mut problems);
        assert!(problems.iter().any(|p| p.contains("AcountDatabase")));
    }

    #[test]
    fn repeated_single_valued_key_is_an_error() {
        let mut config = Configuration::parse(
            "AccountDatabase = /x\nAccountDatabase = /y\nServer\n{\nListenAddresses = a\n}\n",
        )
        .unwrap();
        let mut problems = Vec::new();
        schema().verify(&mut config, "", &mut problems);
        assert!(problems
            .iter()
            .any(|p| p.contains("more than once")), "{problems:?}");
    }

    #[test]
    fn bad_integer_is_reported_with_block_path() {
        let mut config = Configuration::parse(
            "AccountDatabase = /x\nServer\n{\nListenAddresses = a\nMaximumRefusedConnections = lots\n}\n",
        )
        .unwrap();
        let mut problems = Vec::new();
        schema().verify(&mut config, "", &mut problems);
        assert!(problems
            .iter()
            .any(|p| p.starts_with("Server.") && p.contains("lots")));
    }

    #[test]
    fn any_name_sub_blocks_share_schema() {
        let schema = Schema::new(
            vec![],
            SubBlocks::AnyName(Box::new(Schema::new(
                vec![KeyRule::required("SetNumber", ValueKind::Int)],
                SubBlocks::None,
            ))),
        );
        let mut config =
            Configuration::parse("disc0\n{\nSetNumber = 0\n}\ndisc1\n{\n}\n").unwrap();
        let mut problems = Vec::new();
        schema.verify(&mut config, "", &mut problems);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("disc1.SetNumber"));
    }
}
