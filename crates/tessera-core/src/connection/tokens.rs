//! Local mirror of the upstream token store
//!
//! Tokens are `(index, name)` pairs per [`TokenGroup`]. The upstream is the
//! authority; this mirror only learns pairs from `token` responses and is
//! re-validated after every authentication.

use crate::{Error, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tessera_protocol::TokenGroup;

#[derive(Default)]
struct GroupTokens {
    by_index: BTreeMap<u64, String>,
    by_name: HashMap<String, u64>,
}

impl GroupTokens {
    /// Existing pairs are never reassigned
    fn insert(&mut self, index: u64, name: String) -> Result<()> {
        if let Some(existing) = self.by_index.get(&index) {
            if *existing != name {
                return Err(Error::malformed(format!(
                    "Token index {} is '{}' locally but '{}' upstream",
                    index, existing, name
                )));
            }
            return Ok(());
        }
        if let Some(existing) = self.by_name.get(&name) {
            return Err(Error::malformed(format!(
                "Token '{}' has index {} locally but {} upstream",
                name, existing, index
            )));
        }
        self.by_index.insert(index, name.clone());
        self.by_name.insert(name, index);
        Ok(())
    }
}

/// Bidirectional index/name map for every token group
#[derive(Default)]
pub struct TokenStore {
    groups: RwLock<HashMap<TokenGroup, GroupTokens>>,
}

impl TokenStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one token. Fails when it contradicts a known pair.
    pub fn insert(&self, group: TokenGroup, index: u64, name: impl Into<String>) -> Result<()> {
        self.groups
            .write()
            .entry(group)
            .or_default()
            .insert(index, name.into())
    }

    /// Name of a token index
    pub fn name(&self, group: TokenGroup, index: u64) -> Option<String> {
        self.groups
            .read()
            .get(&group)
            .and_then(|g| g.by_index.get(&index).cloned())
    }

    /// Index of a token name
    pub fn index(&self, group: TokenGroup, name: &str) -> Option<u64> {
        self.groups
            .read()
            .get(&group)
            .and_then(|g| g.by_name.get(name).copied())
    }

    /// Every known index of a group, ascending
    pub fn indices(&self, group: TokenGroup) -> Vec<u64> {
        self.groups
            .read()
            .get(&group)
            .map(|g| g.by_index.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Number of tokens in a group
    pub fn len(&self, group: TokenGroup) -> usize {
        self.groups.read().get(&group).map_or(0, |g| g.by_index.len())
    }

    /// Apply an unsolicited `list` response: `groups.{ET,RT,EN,KW}` arrays of
    /// `[index, name]`. Returns the number of tokens recorded.
    pub fn apply_list(&self, message: &Value) -> Result<usize> {
        let groups = message
            .get("groups")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::malformed("Token list response without groups"))?;

        let mut count = 0;
        for group in TokenGroup::ALL {
            let Some(entries) = groups.get(group.as_str()) else {
                continue;
            };
            let entries = entries.as_array().ok_or_else(|| {
                Error::malformed(format!("Token group {} is not an array", group))
            })?;
            for entry in entries {
                let (index, name) = match entry.as_array().map(Vec::as_slice) {
                    Some([index, name]) => (index.as_u64(), name.as_str()),
                    _ => (None, None),
                };
                let (Some(index), Some(name)) = (index, name) else {
                    return Err(Error::malformed(format!(
                        "Bad token entry in group {}: {}",
                        group, entry
                    )));
                };
                self.insert(group, index, name)?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Apply an `added`/`found` response: `group` plus `pairs` of
    /// `[name, index]`. Returns the number of tokens recorded.
    pub fn apply_pairs(&self, message: &Value) -> Result<usize> {
        let group = message
            .get("group")
            .and_then(Value::as_str)
            .and_then(parse_group)
            .ok_or_else(|| Error::malformed("Token response without a known group"))?;
        let pairs = message
            .get("pairs")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::malformed("Token response without pairs"))?;

        for pair in pairs {
            let (name, index) = match pair.as_array().map(Vec::as_slice) {
                Some([name, index]) => (name.as_str(), index.as_u64()),
                _ => (None, None),
            };
            let (Some(name), Some(index)) = (name, index) else {
                return Err(Error::malformed(format!("Bad token pair: {}", pair)));
            };
            self.insert(group, index, name)?;
        }
        Ok(pairs.len())
    }
}

/// Parse a wire group name
pub fn parse_group(name: &str) -> Option<TokenGroup> {
    TokenGroup::ALL.into_iter().find(|g| g.as_str() == name)
}
