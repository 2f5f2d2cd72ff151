//! URL path → cache key index.
//!
//! Keys are opaque hashes, so a path-based purge needs to know which keys
//! were written for which paths.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use glob::{MatchOptions, Pattern};

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::index";

const PATH_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Tracks path → keys and key → path so either side can be cleaned up.
#[derive(Debug, Default)]
pub struct KeyIndex {
    path_to_keys: RwLock<HashMap<String, HashSet<String>>>,
    key_to_path: RwLock<HashMap<String, String>>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `key` holds a response for `path`. A key moves if it was
    /// previously recorded under another path.
    pub fn register(&self, path: &str, key: &str) {
        let mut p2k = rw_write(&self.path_to_keys, SOURCE, "register.path_to_keys");
        let mut k2p = rw_write(&self.key_to_path, SOURCE, "register.key_to_path");

        if let Some(previous) = k2p.insert(key.to_string(), path.to_string())
            && previous != path
            && let Some(keys) = p2k.get_mut(&previous)
        {
            keys.remove(key);
            if keys.is_empty() {
                p2k.remove(&previous);
            }
        }
        p2k.entry(path.to_string())
            .or_default()
            .insert(key.to_string());
    }

    pub fn keys_for_path(&self, path: &str) -> HashSet<String> {
        rw_read(&self.path_to_keys, SOURCE, "keys_for_path")
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove every path matching `pattern`, returning the keys they held.
    pub fn take_matching(&self, pattern: &Pattern) -> Vec<String> {
        let mut p2k = rw_write(&self.path_to_keys, SOURCE, "take_matching.path_to_keys");
        let mut k2p = rw_write(&self.key_to_path, SOURCE, "take_matching.key_to_path");

        let paths: Vec<String> = p2k
            .keys()
            .filter(|path| pattern.matches_with(path, PATH_MATCH))
            .cloned()
            .collect();

        let mut taken = Vec::new();
        for path in paths {
            if let Some(keys) = p2k.remove(&path) {
                for key in keys {
                    k2p.remove(&key);
                    taken.push(key);
                }
            }
        }
        taken
    }

    pub fn unregister(&self, key: &str) {
        let mut p2k = rw_write(&self.path_to_keys, SOURCE, "unregister.path_to_keys");
        let mut k2p = rw_write(&self.key_to_path, SOURCE, "unregister.key_to_path");

        if let Some(path) = k2p.remove(key)
            && let Some(keys) = p2k.get_mut(&path)
        {
            keys.remove(key);
            if keys.is_empty() {
                p2k.remove(&path);
            }
        }
    }

    pub fn clear(&self) {
        rw_write(&self.path_to_keys, SOURCE, "clear.path_to_keys").clear();
        rw_write(&self.key_to_path, SOURCE, "clear.key_to_path").clear();
    }

    pub fn path_count(&self) -> usize {
        rw_read(&self.path_to_keys, SOURCE, "path_count").len()
    }

    pub fn key_count(&self) -> usize {
        rw_read(&self.key_to_path, SOURCE, "key_count").len()
    }
}
