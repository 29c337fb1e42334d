//! Declarative command catalog.
//!
//! The controller answers every command from a static table keyed by the
//! command token. The table is loaded once from a JSON document at startup
//! and is read-only afterwards; dispatch never mutates it.
//!
//! # Resolution rules
//!
//! The four command groups resolve differently, matching the wire behavior
//! of the reference controller:
//!
//! - **G-codes / M-codes**: the leading code of the line is uppercased and
//!   matched exactly (`g0 x10` resolves `G0`, `m490.1` resolves `M490.1`).
//! - **Console commands**: the first whitespace-separated word, compared
//!   case-insensitively (`LS -s` resolves `ls`).
//! - **Host commands**: matched when the line *starts with* the key
//!   (`$J X10` resolves `$J`; `?` resolves `?`). Longer keys win.
//!
//! Descriptors marked `instant` additionally feed the framer's
//! dispatch-without-newline set via [`Catalog::instant_keys`].

use std::collections::{BTreeSet, HashMap};

use serde::Deserialize;
use thiserror::Error;

/// Default artificial reply latency in milliseconds.
///
/// The dispatcher floors every delay at this value regardless of what the
/// catalog says, so the table only needs `time_ms` for slower commands.
pub const DEFAULT_TIME_MS: u64 = 100;

/// Error raised while loading the catalog document.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The JSON document did not parse or did not match the schema.
    #[error("malformed catalog document: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One entry of the command table.
///
/// Every boolean defaults to `false` and `time_ms` to [`DEFAULT_TIME_MS`],
/// so catalog entries only spell out what differs from a plain
/// acknowledge-after-100ms command.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandDescriptor {
    /// Static reply body. May be empty or span multiple lines.
    #[serde(default)]
    pub response: String,

    /// Append `ok\n` after the response body.
    #[serde(default)]
    pub sends_ok: bool,

    /// The command changes persistent state on real hardware. Informational
    /// only; dispatch does not track modal state.
    #[serde(default)]
    pub modal: bool,

    /// Minimum artificial delay before the reply, in milliseconds.
    #[serde(default = "default_time_ms")]
    pub time_ms: u64,

    /// Dispatch as soon as the accumulated input equals the key, without
    /// waiting for a line terminator.
    #[serde(default)]
    pub instant: bool,

    /// Append the end-of-transmission sentinel byte `0x04` after the reply.
    #[serde(default)]
    pub eot_terminated: bool,

    /// Emit send/recv wire traces at DEBUG instead of INFO. Used for
    /// high-frequency polling commands that would otherwise flood the log.
    #[serde(default)]
    pub debug_output_only: bool,
}

fn default_time_ms() -> u64 {
    DEFAULT_TIME_MS
}

/// On-disk shape of the catalog document.
#[derive(Debug, Default, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    g_codes: HashMap<String, CommandDescriptor>,
    #[serde(default)]
    m_codes: HashMap<String, CommandDescriptor>,
    #[serde(default)]
    console_commands: HashMap<String, CommandDescriptor>,
    #[serde(default)]
    host_commands: HashMap<String, CommandDescriptor>,
}

/// Immutable command table.
#[derive(Debug)]
pub struct Catalog {
    g_codes: HashMap<String, CommandDescriptor>,
    m_codes: HashMap<String, CommandDescriptor>,
    console: HashMap<String, CommandDescriptor>,
    /// Host keys sorted longest-first so `$H` never shadows `$HX`-style keys.
    host_ordered: Vec<String>,
    host: HashMap<String, CommandDescriptor>,
    instant: BTreeSet<String>,
}

impl Catalog {
    /// Parses a catalog from its JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Malformed`] when the document is not valid
    /// JSON or does not match the catalog schema.
    pub fn from_json(document: &str) -> Result<Self, CatalogError> {
        let doc: CatalogDocument = serde_json::from_str(document)?;
        Ok(Self::from_document(doc))
    }

    fn from_document(doc: CatalogDocument) -> Self {
        let mut instant = BTreeSet::new();
        for (key, desc) in doc
            .g_codes
            .iter()
            .chain(doc.m_codes.iter())
            .chain(doc.console_commands.iter())
            .chain(doc.host_commands.iter())
        {
            if desc.instant {
                instant.insert(key.clone());
            }
        }

        let mut host_ordered: Vec<String> = doc.host_commands.keys().cloned().collect();
        host_ordered.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        Self {
            g_codes: doc.g_codes,
            m_codes: doc.m_codes,
            console: doc.console_commands,
            host_ordered,
            host: doc.host_commands,
            instant,
        }
    }

    /// Looks up a descriptor by its exact (normalized) key.
    ///
    /// G-/M-code tokens are uppercased before the lookup; console and host
    /// keys are matched verbatim.
    #[must_use]
    pub fn lookup(&self, token: &str) -> Option<&CommandDescriptor> {
        if token.starts_with(['G', 'g', 'M', 'm']) {
            let upper = token.to_ascii_uppercase();
            if let Some(desc) = self.g_codes.get(&upper).or_else(|| self.m_codes.get(&upper)) {
                return Some(desc);
            }
        }
        self.console.get(token).or_else(|| self.host.get(token))
    }

    /// Resolves a full command line to `(canonical key, descriptor)`.
    ///
    /// Returns `None` for lines no catalog group claims.
    #[must_use]
    pub fn resolve_line(&self, line: &str) -> Option<(&str, &CommandDescriptor)> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        // Host commands first: their keys are symbols, not words, and match
        // on the line prefix.
        for key in &self.host_ordered {
            if line.starts_with(key.as_str()) {
                return self.host.get(key).map(|d| (key.as_str(), d));
            }
        }

        let word = line.split_whitespace().next()?;

        for (key, desc) in &self.console {
            if key.eq_ignore_ascii_case(word) {
                return Some((key.as_str(), desc));
            }
        }

        if let Some(code) = machine_code(word) {
            if let Some((key, desc)) = self.g_codes.get_key_value(code.as_str()) {
                return Some((key.as_str(), desc));
            }
            if let Some((key, desc)) = self.m_codes.get_key_value(code.as_str()) {
                return Some((key.as_str(), desc));
            }
        }

        None
    }

    /// The set of keys the framer may dispatch without a line terminator.
    #[must_use]
    pub fn instant_keys(&self) -> &BTreeSet<String> {
        &self.instant
    }
}

/// Extracts an uppercased G-/M-code from the leading token of a line.
///
/// Accepts an optional decimal suffix (`M490.1`). Anything else — including
/// a bare `G` or trailing junk like `G0abc` — is not a code.
fn machine_code(word: &str) -> Option<String> {
    let mut chars = word.chars();
    let letter = chars.next()?;
    if !matches!(letter, 'G' | 'g' | 'M' | 'm') {
        return None;
    }
    let rest = chars.as_str();
    if rest.is_empty() {
        return None;
    }
    let (digits, suffix) = match rest.split_once('.') {
        Some((d, s)) => (d, Some(s)),
        None => (rest, None),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if let Some(suffix) = suffix {
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    Some(word.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "g_codes": {
            "G0": { "sends_ok": true, "modal": true },
            "G28": { "sends_ok": true, "time_ms": 1500 },
            "G54": { "sends_ok": true, "modal": true }
        },
        "m_codes": {
            "M3": { "sends_ok": true, "modal": true, "time_ms": 500 },
            "M490.1": { "sends_ok": true }
        },
        "console_commands": {
            "version": { "response": "version = 1.0.3c1.0.6" },
            "ls": { "eot_terminated": true }
        },
        "host_commands": {
            "$G": { "response": "[G0 G54]" },
            "$I": { "response": "[G0 G54]", "instant": true },
            "?": { "response": "<Idle>", "instant": true, "debug_output_only": true }
        }
    }"#;

    fn catalog() -> Catalog {
        Catalog::from_json(DOC).expect("test document parses")
    }

    #[test]
    fn resolves_g_code_case_insensitively_with_arguments() {
        let catalog = catalog();
        let (key, desc) = catalog.resolve_line("g0 X10 Y5 F100").unwrap();
        assert_eq!(key, "G0");
        assert!(desc.sends_ok);
        assert!(desc.modal);
    }

    #[test]
    fn resolves_m_code_with_decimal_suffix() {
        let catalog = catalog();
        let (key, _) = catalog.resolve_line("m490.1").unwrap();
        assert_eq!(key, "M490.1");
    }

    #[test]
    fn resolves_console_command_case_insensitively() {
        let catalog = catalog();
        let (key, desc) = catalog.resolve_line("VERSION").unwrap();
        assert_eq!(key, "version");
        assert_eq!(desc.response, "version = 1.0.3c1.0.6");
    }

    #[test]
    fn resolves_host_command_by_prefix() {
        let catalog = catalog();
        let (key, _) = catalog.resolve_line("$G").unwrap();
        assert_eq!(key, "$G");
        let (key, desc) = catalog.resolve_line("?").unwrap();
        assert_eq!(key, "?");
        assert!(desc.instant);
        assert!(desc.debug_output_only);
    }

    #[test]
    fn unknown_lines_do_not_resolve() {
        let catalog = catalog();
        assert!(catalog.resolve_line("foo").is_none());
        assert!(catalog.resolve_line("G").is_none());
        assert!(catalog.resolve_line("G0abc").is_none());
        assert!(catalog.resolve_line("G99").is_none());
        assert!(catalog.resolve_line("").is_none());
    }

    #[test]
    fn instant_keys_collects_flagged_entries() {
        let catalog = catalog();
        let keys: Vec<&str> = catalog.instant_keys().iter().map(String::as_str).collect();
        assert_eq!(keys, ["$I", "?"]);
    }

    #[test]
    fn defaults_apply_to_sparse_entries() {
        let catalog = catalog();
        let desc = catalog.lookup("ls").unwrap();
        assert_eq!(desc.time_ms, DEFAULT_TIME_MS);
        assert!(!desc.sends_ok);
        assert!(desc.eot_terminated);
        assert!(!desc.instant);
    }

    #[test]
    fn lookup_normalizes_machine_codes_only() {
        let catalog = catalog();
        assert!(catalog.lookup("g28").is_some());
        assert!(catalog.lookup("LS").is_none());
        assert!(catalog.lookup("ls").is_some());
    }

    #[test]
    fn malformed_document_is_rejected() {
        assert!(Catalog::from_json("{ not json").is_err());
        assert!(Catalog::from_json(r#"{"g_codes": []}"#).is_err());
    }
}
