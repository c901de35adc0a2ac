// Cheap name-based duplicate signal: identifiers sharing the first few
// characters of their leading domain label are assumed to be the same brand.

use serde::Serialize;
use std::collections::{HashMap, HashSet};

pub const KEY_LEN: usize = 4;

/// Short grouping key of a domain or file name.
///
/// The identifier is split on `.`, `-` and `_`; the key is at most the first
/// [`KEY_LEN`] characters of the lowercased first token. Shorter tokens are
/// used whole. Lowercasing comes first since it can add characters.
pub fn prefix_key(identifier: &str) -> String {
    let token = identifier.split(['.', '-', '_']).next().unwrap_or_default();
    token.chars().flat_map(char::to_lowercase).take(KEY_LEN).collect()
}

/// A key with more than one member: the first is kept, the rest are
/// duplicates of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DedupGroup {
    pub key: String,
    pub canonical: String,
    pub duplicates: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixGroups {
    order: Vec<String>,
    members: HashMap<String, Vec<String>>,
}

impl PrefixGroups {
    /// Group identifiers by key, then fold every 4-character key into its
    /// 3-character truncation when that key is also present. The fold is a
    /// single pass over the original keys; 3-character groups never fold
    /// further.
    pub fn build<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut order: Vec<String> = Vec::new();
        let mut members: HashMap<String, Vec<String>> = HashMap::new();
        for id in identifiers {
            let id = id.as_ref();
            let key = prefix_key(id);
            members
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push(key);
                    Vec::new()
                })
                .push(id.to_string());
        }

        let present: HashSet<String> = order.iter().cloned().collect();
        let mut absorbed = HashSet::new();
        for key in &order {
            if key.chars().count() != KEY_LEN {
                continue;
            }
            let short: String = key.chars().take(KEY_LEN - 1).collect();
            if !present.contains(&short) {
                continue;
            }
            if let Some(moved) = members.remove(key) {
                log::debug!("folding prefix group {} into {}", key, short);
                members.entry(short).or_default().extend(moved);
                absorbed.insert(key.clone());
            }
        }
        order.retain(|k| !absorbed.contains(k));

        Self { order, members }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.members.contains_key(key)
    }

    /// The group an identifier would land in, if that group already exists:
    /// its own key, or the 3-character key its 4-character key folds into.
    pub fn group_key_for(&self, identifier: &str) -> Option<&str> {
        let key = prefix_key(identifier);
        if let Some((k, _)) = self.members.get_key_value(&key) {
            return Some(k.as_str());
        }
        if key.chars().count() == KEY_LEN {
            let short: String = key.chars().take(KEY_LEN - 1).collect();
            return self.members.get_key_value(&short).map(|(k, _)| k.as_str());
        }
        None
    }

    pub fn members(&self, key: &str) -> Option<&[String]> {
        self.members.get(key).map(Vec::as_slice)
    }

    /// Every group, singletons included, in first-appearance order of keys.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.order
            .iter()
            .filter_map(|k| self.members.get(k).map(|m| (k.as_str(), m.as_slice())))
    }

    /// Groups with more than one member.
    pub fn duplicate_groups(&self) -> Vec<DedupGroup> {
        self.iter()
            .filter(|(_, members)| members.len() > 1)
            .map(|(key, members)| DedupGroup {
                key: key.to_string(),
                canonical: members[0].clone(),
                duplicates: members[1..].to_vec(),
            })
            .collect()
    }
}
