// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment overrides loaded from an auxiliary JSON file.
//!
//! The file holds a flat JSON object. String values override process
//! variables, `null` marks a variable as unset, other scalars are converted to
//! strings. The process environment itself is never modified; the overrides
//! only take part in configuration lookups.

use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::{Result, SafeInitError};

/// Variable naming the overrides file.
pub const EXTRA_ENV_FILE_VAR: &str = "SAFE_INIT_EXTRA_ENV_VARS_FILE";

/// File used when [`EXTRA_ENV_FILE_VAR`] is not set.
pub const DEFAULT_EXTRA_ENV_FILE: &str = ".env.json";

/// Parsed set of environment overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraEnv {
    vars: BTreeMap<String, Option<String>>,
}

impl ExtraEnv {
    /// Parse overrides from JSON text.
    ///
    /// Fails when the text is not a JSON object. Nested arrays and objects are
    /// kept as their JSON text.
    pub fn parse(contents: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(contents)?;
        let Value::Object(map) = value else {
            return Err(SafeInitError::Config(
                "extra environment file must contain a JSON object".to_string(),
            ));
        };

        let mut vars = BTreeMap::new();
        for (key, value) in map {
            let value = match value {
                Value::Null => None,
                Value::String(s) => Some(s),
                other => {
                    warn!(key = %key, value = %other, "Converting non-string extra env value to string");
                    Some(other.to_string())
                }
            };
            vars.insert(key, value);
        }

        Ok(Self { vars })
    }

    /// Load overrides from a file, never failing.
    ///
    /// A missing or empty file yields no overrides; unreadable or malformed
    /// content is logged and ignored.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No extra env file found");
                return Self::default();
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to read extra env file");
                return Self::default();
            }
        };

        if contents.trim().is_empty() {
            return Self::default();
        }

        match Self::parse(&contents) {
            Ok(extra) => {
                debug!(path = %path.display(), count = extra.len(), "Loaded extra env overrides");
                extra
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Ignoring malformed extra env file");
                Self::default()
            }
        }
    }

    /// Load overrides from the file named by `SAFE_INIT_EXTRA_ENV_VARS_FILE`
    /// (default `.env.json` in the working directory).
    pub fn from_env() -> Self {
        let path = env::var(EXTRA_ENV_FILE_VAR).unwrap_or_else(|_| DEFAULT_EXTRA_ENV_FILE.to_string());
        Self::load(path)
    }

    /// Override entry for `key`.
    ///
    /// `None` means the file does not mention the key; `Some(None)` means the
    /// file explicitly unsets it.
    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        self.vars.get(key).map(|v| v.as_deref())
    }

    /// Resolve `key`, consulting the overrides first and `fallback` otherwise.
    pub fn lookup(&self, key: &str, fallback: impl FnOnce(&str) -> Option<String>) -> Option<String> {
        match self.get(key) {
            Some(value) => value.map(str::to_string),
            None => fallback(key),
        }
    }

    /// Number of entries in the file.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// True when the file contributed no entries.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
