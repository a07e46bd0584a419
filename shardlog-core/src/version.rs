//! Opaque object versions used for compare-and-swap.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Length of the random tag minted when an object is first created.
pub const VERSION_TAG_LEN: usize = 24;

/// An opaque `(counter, tag)` version pair.
///
/// Pair equality is the only safe "no change" test: the tag distinguishes a
/// fresh object after destroy/recreate from an ordinary advance. Counter
/// ordering is only meaningful under the same tag.
///
/// The default value (`ver == 0`, empty tag) means "nothing observed yet"
/// and satisfies any read floor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectVersion {
    pub ver: u64,
    pub tag: String,
}

impl ObjectVersion {
    /// Version for the very first write of an object: counter 1 plus a
    /// freshly minted random alphabetic tag.
    pub fn initial() -> Self {
        Self {
            ver: 1,
            tag: random_tag(),
        }
    }

    /// Advance the counter, keeping the tag.
    pub fn inc(&mut self) {
        self.ver += 1;
    }

    /// Whether this version's counter is at least `floor`'s.
    pub fn at_least(&self, floor: &ObjectVersion) -> bool {
        self.ver >= floor.ver
    }
}

impl std::fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.ver, self.tag)
    }
}

fn random_tag() -> String {
    let mut rng = rand::thread_rng();
    (0..VERSION_TAG_LEN)
        .map(|_| {
            let i = rng.gen_range(0..52u8);
            char::from(if i < 26 { b'a' + i } else { b'A' + i - 26 })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_version_mints_alphabetic_tag() {
        let v = ObjectVersion::initial();
        assert_eq!(v.ver, 1);
        assert_eq!(v.tag.len(), VERSION_TAG_LEN);
        assert!(v.tag.chars().all(|c| c.is_ascii_alphabetic()));
    }

    #[test]
    fn distinct_objects_get_distinct_tags() {
        assert_ne!(ObjectVersion::initial().tag, ObjectVersion::initial().tag);
    }

    #[test]
    fn inc_advances_counter_only() {
        let mut v = ObjectVersion::initial();
        let tag = v.tag.clone();
        v.inc();
        assert_eq!(v.ver, 2);
        assert_eq!(v.tag, tag);
    }

    #[test]
    fn default_satisfies_any_floor() {
        let held = ObjectVersion::default();
        let stored = ObjectVersion::initial();
        assert!(stored.at_least(&held));
        assert_ne!(stored, held);
    }
}
