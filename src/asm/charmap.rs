//! Character maps: translation of string literals into emitted bytes.
//!
//! Charmaps are named and form a stack (`PUSHC`/`POPC`); exactly one is
//! active at a time. Encoding is greedy longest-match; a charmap with no
//! entries passes UTF-8 bytes through unchanged.

use indexmap::IndexMap;

/// The charmap that exists and is active at startup.
pub const MAIN_CHARMAP: &str = "main";

/// One named charmap.
#[derive(Debug, Default, Clone)]
pub struct Charmap {
    entries: IndexMap<String, Vec<u8>>,
    longest: usize,
}

impl Charmap {
    /// Add or replace a mapping. Returns `false` if the mapping replaced
    /// an existing one.
    pub fn add(&mut self, from: &str, to: Vec<u8>) -> bool {
        self.longest = self.longest.max(from.len());
        self.entries.insert(from.to_owned(), to).is_none()
    }

    /// Whether the charmap has no entries and therefore passes bytes
    /// through.
    pub fn is_identity(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode `text`, appending to `out`. On failure returns the character
    /// with no mapping.
    pub fn encode(&self, text: &str, out: &mut Vec<u8>) -> Result<(), char> {
        if self.is_identity() {
            out.extend_from_slice(text.as_bytes());
            return Ok(());
        }
        let mut rest = text;
        while !rest.is_empty() {
            let limit = self.longest.min(rest.len());
            let mut matched = None;
            for len in (1..=limit).rev() {
                if !rest.is_char_boundary(len) {
                    continue;
                }
                if let Some(bytes) = self.entries.get(&rest[..len]) {
                    matched = Some((len, bytes));
                    break;
                }
            }
            match matched {
                Some((len, bytes)) => {
                    out.extend_from_slice(bytes);
                    rest = &rest[len..];
                }
                None => return Err(rest.chars().next().unwrap_or('\u{FFFD}')),
            }
        }
        Ok(())
    }
}

/// All charmaps plus the activation stack.
#[derive(Debug)]
pub struct Charmaps {
    maps: IndexMap<String, Charmap>,
    active: String,
    stack: Vec<String>,
}

impl Default for Charmaps {
    fn default() -> Self {
        let mut maps = IndexMap::new();
        maps.insert(MAIN_CHARMAP.to_owned(), Charmap::default());
        Charmaps {
            maps,
            active: MAIN_CHARMAP.to_owned(),
            stack: Vec::new(),
        }
    }
}

impl Charmaps {
    /// The active charmap.
    pub fn active(&self) -> &Charmap {
        &self.maps[&self.active]
    }

    /// The active charmap, for adding entries.
    pub fn active_mut(&mut self) -> &mut Charmap {
        self.maps.get_mut(&self.active).unwrap()
    }

    /// Create a new charmap and make it active. `base` copies an existing
    /// charmap's entries.
    pub fn create(&mut self, name: &str, base: Option<&str>) -> Result<(), String> {
        if self.maps.contains_key(name) {
            return Err(format!("charmap `{}` already exists", name));
        }
        let initial = match base {
            Some(base_name) => self
                .maps
                .get(base_name)
                .cloned()
                .ok_or_else(|| format!("base charmap `{}` does not exist", base_name))?,
            None => Charmap::default(),
        };
        self.maps.insert(name.to_owned(), initial);
        self.active = name.to_owned();
        Ok(())
    }

    /// Make an existing charmap active.
    pub fn set_active(&mut self, name: &str) -> Result<(), String> {
        if !self.maps.contains_key(name) {
            return Err(format!("charmap `{}` does not exist", name));
        }
        self.active = name.to_owned();
        Ok(())
    }

    /// Push the active charmap name; a later POPC restores it.
    pub fn push(&mut self) {
        self.stack.push(self.active.clone());
    }

    /// Restore the last pushed charmap.
    pub fn pop(&mut self) -> Result<(), String> {
        match self.stack.pop() {
            Some(name) => {
                self.active = name;
                Ok(())
            }
            None => Err(String::from("no entries in the charmap stack")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_passthrough() {
        let map = Charmap::default();
        let mut out = Vec::new();
        map.encode("héllo", &mut out).unwrap();
        assert_eq!(out, "héllo".as_bytes());
    }

    #[test]
    fn longest_match_wins() {
        let mut map = Charmap::default();
        map.add("a", vec![1]);
        map.add("ab", vec![2]);
        map.add("b", vec![3]);
        let mut out = Vec::new();
        map.encode("aba", &mut out).unwrap();
        assert_eq!(out, [2, 1]);
    }

    #[test]
    fn unmapped_character_reported() {
        let mut map = Charmap::default();
        map.add("a", vec![1]);
        let mut out = Vec::new();
        assert_eq!(map.encode("ax", &mut out), Err('x'));
    }
}
