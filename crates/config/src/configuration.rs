use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{ConfigError, ConfigResult};
use crate::verify::Schema;

/// Separator joining the values of a key that appears more than once.
///
/// Repeated keys are only legal where the schema marks the key multi-valued;
/// the separator is a control character so it cannot collide with file text.
pub const MULTI_VALUE_SEPARATOR: char = '\x01';

/// A parsed configuration block: named keys plus named sub-blocks.
///
/// Sub-block order is preserved (the RAID layer relies on it to number disc
/// sets); key order is not.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Configuration {
    name: String,
    keys: BTreeMap<String, String>,
    sub_blocks: Vec<(String, Configuration)>,
}

impl Configuration {
    /// Parses `path` without schema verification.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parses `path` and verifies the result against `schema`.
    ///
    /// Verification applies defaults, so a key with a schema default is
    /// always present in the returned tree.
    pub fn load_and_verify(path: &Path, schema: &Schema) -> ConfigResult<Self> {
        let mut config = Self::load(path)?;
        let mut problems = Vec::new();
        schema.verify(&mut config, "", &mut problems);
        if problems.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError::Verify(problems.join("\n")))
        }
    }

    /// Parses configuration text. Exposed for tests and in-memory use.
    pub fn parse(text: &str) -> ConfigResult<Self> {
        let mut lines = text.lines().map(strip_comment);
        let mut root = Self {
            name: String::new(),
            ..Self::default()
        };
        parse_block(&mut root, &mut lines, true)?;
        Ok(root)
    }

    /// The block's name; empty for the root.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether `key` is present.
    #[must_use]
    pub fn key_exists(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Returns the raw string value of `key`.
    pub fn key_value(&self, key: &str) -> ConfigResult<&str> {
        self.keys
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::NoSuchKey(key.to_owned()))
    }

    /// Returns `key` parsed as a signed integer.
    pub fn key_value_int(&self, key: &str) -> ConfigResult<i64> {
        let value = self.key_value(key)?;
        value.parse().map_err(|_| ConfigError::BadValue {
            key: key.to_owned(),
            wanted: "integer",
            value: value.to_owned(),
        })
    }

    /// Returns `key` parsed as a boolean (`yes`/`true`/`no`/`false`).
    pub fn key_value_bool(&self, key: &str) -> ConfigResult<bool> {
        let value = self.key_value(key)?;
        match value.to_ascii_lowercase().as_str() {
            "yes" | "true" => Ok(true),
            "no" | "false" => Ok(false),
            _ => Err(ConfigError::BadValue {
                key: key.to_owned(),
                wanted: "boolean",
                value: value.to_owned(),
            }),
        }
    }

    /// Returns the individual values of a multi-valued key.
    pub fn key_values(&self, key: &str) -> ConfigResult<Vec<&str>> {
        Ok(self
            .key_value(key)?
            .split(MULTI_VALUE_SEPARATOR)
            .collect())
    }

    /// Names of all keys in this block.
    #[must_use]
    pub fn key_names(&self) -> Vec<&str> {
        self.keys.keys().map(String::as_str).collect()
    }

    /// Returns whether a sub-block named `name` exists.
    #[must_use]
    pub fn sub_block_exists(&self, name: &str) -> bool {
        self.sub_blocks.iter().any(|(n, _)| n == name)
    }

    /// Returns the sub-block named `name`.
    pub fn sub_block(&self, name: &str) -> ConfigResult<&Configuration> {
        self.sub_blocks
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
            .ok_or_else(|| ConfigError::NoSuchBlock(name.to_owned()))
    }

    /// Sub-blocks in file order.
    #[must_use]
    pub fn sub_blocks(&self) -> impl Iterator<Item = (&str, &Configuration)> {
        self.sub_blocks.iter().map(|(n, c)| (n.as_str(), c))
    }

    pub(crate) fn insert_default(&mut self, key: &str, value: &str) {
        self.keys
            .entry(key.to_owned())
            .or_insert_with(|| value.to_owned());
    }

    pub(crate) fn raw_key(&self, key: &str) -> Option<&str> {
        self.keys.get(key).map(String::as_str)
    }

    pub(crate) fn sub_blocks_mut(
        &mut self,
    ) -> impl Iterator<Item = (&str, &mut Configuration)> {
        self.sub_blocks.iter_mut().map(|(n, c)| (n.as_str(), c))
    }

    fn add_key(&mut self, key: String, value: String) {
        // Repeated keys accumulate; the schema decides later whether that
        // was legal.
        self.keys
            .entry(key)
            .and_modify(|existing| {
                existing.push(MULTI_VALUE_SEPARATOR);
                existing.push_str(&value);
            })
            .or_insert(value);
    }
}

fn strip_comment(line: &str) -> &str {
    let line = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };
    line.trim()
}

fn parse_block<'a, I>(block: &mut Configuration, lines: &mut I, root: bool) -> ConfigResult<()>
where
    I: Iterator<Item = &'a str>,
{
    let mut pending_block_name: Option<String> = None;

    while let Some(line) = lines.next() {
        if line.is_empty() {
            continue;
        }

        if line == "{" {
            let Some(name) = pending_block_name.take() else {
                return Err(ConfigError::Syntax(format!(
                    "unexpected start block in {:?}",
                    block.name
                )));
            };
            let mut sub = Configuration {
                name: name.clone(),
                ..Configuration::default()
            };
            parse_sub_block(&mut sub, lines)?;
            block.sub_blocks.push((name, sub));
            continue;
        }

        if line == "}" {
            if root {
                return Err(ConfigError::Syntax(
                    "close block at root level -- unterminated sub-block?".to_owned(),
                ));
            }
            // Signalled by parse_sub_block returning.
            return Ok(());
        }

        if let Some(name) = pending_block_name.take() {
            return Err(ConfigError::Syntax(format!(
                "block {name:?} wasn't started correctly (no '{{' on a line of its own)"
            )));
        }

        match line.split_once('=') {
            Some((key, value)) => {
                let key = key.trim();
                let value = value.trim();
                if key.is_empty() {
                    return Err(ConfigError::Syntax(format!("bad line {line:?}")));
                }
                block.add_key(key.to_owned(), value.to_owned());
            }
            None => {
                pending_block_name = Some(line.to_owned());
            }
        }
    }

    if let Some(name) = pending_block_name {
        return Err(ConfigError::Syntax(format!("block {name:?} never opened")));
    }
    if root {
        Ok(())
    } else {
        Err(ConfigError::Syntax(format!(
            "unterminated block {:?}",
            block.name
        )))
    }
}

// Wrapper keeping the recursion's "found the close brace" signalling inside
// parse_block's Ok(()) return.
fn parse_sub_block<'a, I>(block: &mut Configuration, lines: &mut I) -> ConfigResult<()>
where
    I: Iterator<Item = &'a str>,
{
    parse_block(block, lines, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# store daemon configuration
AccountDatabase = /var/vault/accounts.txt

Server
{
    ListenAddresses = inet:127.0.0.1:2201
    ListenAddresses = inet:[::1]:2201
    Timeout = 900
    ExtendedLogging = no
}
";

    #[test]
    fn parses_keys_and_blocks() {
        let config = Configuration::parse(SAMPLE).unwrap();
        assert_eq!(
            config.key_value("AccountDatabase").unwrap(),
            "/var/vault/accounts.txt"
        );
        let server = config.sub_block("Server").unwrap();
        assert_eq!(server.key_value_int("Timeout").unwrap(), 900);
        assert!(!server.key_value_bool("ExtendedLogging").unwrap());
    }

    #[test]
    fn repeated_keys_accumulate_as_multi_value() {
        let config = Configuration::parse(SAMPLE).unwrap();
        let server = config.sub_block("Server").unwrap();
        let addrs = server.key_values("ListenAddresses").unwrap();
        assert_eq!(
            addrs,
            ["inet:127.0.0.1:2201", "inet:[::1]:2201"]
        );
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let config = Configuration::parse("# nothing\n\nA = 1 # trailing\n").unwrap();
        assert_eq!(config.key_value("A").unwrap(), "1");
    }

    #[test]
    fn unterminated_block_is_a_syntax_error() {
        let err = Configuration::parse("Server\n{\nA = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Syntax(_)));
    }

    #[test]
    fn stray_close_brace_is_a_syntax_error() {
        let err = Configuration::parse("}\n").unwrap_err();
        assert!(matches!(err, ConfigError::Syntax(_)));
    }

    #[test]
    fn block_without_open_brace_is_a_syntax_error() {
        let err = Configuration::parse("Server\nA = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Syntax(_)));
    }

    #[test]
    fn missing_key_is_reported_by_name() {
        let config = Configuration::parse("A = 1\n").unwrap();
        let err = config.key_value("B").unwrap_err();
        assert!(matches!(err, ConfigError::NoSuchKey(name) if name == "B"));
    }

    #[test]
    fn nested_blocks_parse() {
        let config =
            Configuration::parse("Outer\n{\nInner\n{\nX = 2\n}\n}\n").unwrap();
        let inner = config
            .sub_block("Outer")
            .unwrap()
            .sub_block("Inner")
            .unwrap();
        assert_eq!(inner.key_value_int("X").unwrap(), 2);
    }
}
