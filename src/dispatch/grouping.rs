//! Grouping strategies for selecting output connections.
//!
//! A [`Grouping`] is a pure value describing how an outbound message picks its
//! targets from a fixed pool. The only state a grouping needs, the round-robin
//! cursor, lives in a [`Selector`] owned by the dispatcher using it.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};

/// How an outbound message selects pool members.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Grouping {
  /// Cycle through pool members in pool order.
  #[default]
  RoundRobin,
  /// Pick a member uniformly at random.
  Random,
  /// Pick a member by hashing the listed body fields.
  Fields {
    /// Top-level body fields whose values determine the target.
    fields: Vec<String>,
  },
  /// Send to every member.
  All,
}

impl Grouping {
  /// Creates a fields grouping over the given field names.
  pub fn fields<I, S>(fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Grouping::Fields {
      fields: fields.into_iter().map(Into::into).collect(),
    }
  }
}

/// Applies a [`Grouping`] to pools of a given size.
#[derive(Debug, Default)]
pub struct Selector {
  grouping: Grouping,
  cursor: AtomicUsize,
}

impl Selector {
  /// Creates a selector with a fresh round-robin cursor.
  #[must_use]
  pub fn new(grouping: Grouping) -> Self {
    Self {
      grouping,
      cursor: AtomicUsize::new(0),
    }
  }

  /// The grouping this selector applies.
  pub fn grouping(&self) -> &Grouping {
    &self.grouping
  }

  /// Returns the indices of the pool members that should receive `body`.
  ///
  /// An empty pool always yields no indices.
  pub fn select(&self, body: &Value, pool_size: usize) -> Vec<usize> {
    if pool_size == 0 {
      return Vec::new();
    }
    match &self.grouping {
      Grouping::RoundRobin => {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
        vec![idx % pool_size]
      }
      Grouping::Random => vec![rand::thread_rng().gen_range(0..pool_size)],
      Grouping::Fields { fields } => vec![(hash_fields(body, fields) % pool_size as u64) as usize],
      Grouping::All => (0..pool_size).collect(),
    }
  }
}

/// Hashes the values of `fields` in `body`; missing fields hash as `null`.
///
/// The hash is the first eight bytes of a SHA-256 over each field name and
/// its JSON text, so every process and build routes a key the same way.
fn hash_fields(body: &Value, fields: &[String]) -> u64 {
  let mut hasher = Sha256::new();
  for field in fields {
    hasher.update(field.as_bytes());
    hasher.update([0u8]);
    // serde_json renders object keys in a stable order, so equal values
    // always produce equal text.
    hasher.update(body.get(field).unwrap_or(&Value::Null).to_string().as_bytes());
    hasher.update([0u8]);
  }
  let digest = hasher.finalize();
  let mut prefix = [0u8; 8];
  prefix.copy_from_slice(&digest[..8]);
  u64::from_be_bytes(prefix)
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;
  use serde_json::json;

  #[test]
  fn test_round_robin_starts_at_first_member() {
    let selector = Selector::new(Grouping::RoundRobin);
    let picks: Vec<usize> = (0..5)
      .flat_map(|_| selector.select(&json!({}), 3))
      .collect();
    assert_eq!(picks, vec![0, 1, 2, 0, 1]);
  }

  #[test]
  fn test_all_selects_every_member() {
    let selector = Selector::new(Grouping::All);
    assert_eq!(selector.select(&json!({}), 4), vec![0, 1, 2, 3]);
  }

  #[test]
  fn test_empty_pool_selects_nothing() {
    for grouping in [Grouping::RoundRobin, Grouping::Random, Grouping::All] {
      assert!(Selector::new(grouping).select(&json!({}), 0).is_empty());
    }
  }

  #[test]
  fn test_fields_missing_field_is_stable() {
    let selector = Selector::new(Grouping::fields(["user"]));
    let a = selector.select(&json!({"other": 1}), 7);
    let b = selector.select(&json!({"other": 2}), 7);
    assert_eq!(a, b);
  }

  #[test]
  fn test_fields_hash_is_fixed_across_builds() {
    assert_eq!(hash_fields(&json!({"word": "apple"}), &["word".to_string()]), 11921708696435472538);
    assert_eq!(hash_fields(&json!({}), &["user".to_string()]), 12915411967347375445);
    assert_eq!(
      hash_fields(&json!({"user": 42, "region": "eu"}), &["user".to_string(), "region".to_string()]),
      14457696541514100011
    );

    let selector = Selector::new(Grouping::fields(["word"]));
    assert_eq!(selector.select(&json!({"word": "apple"}), 7), vec![2]);
    assert_eq!(selector.select(&json!({"word": "banana"}), 7), vec![1]);
    assert_eq!(selector.select(&json!({"word": "apple", "n": 3}), 16), vec![10]);
  }

  #[test]
  fn test_grouping_deserializes_from_config() {
    let g: Grouping = serde_json::from_value(json!({"type": "fields", "fields": ["a", "b"]})).unwrap();
    assert_eq!(g, Grouping::fields(["a", "b"]));
    let g: Grouping = serde_json::from_value(json!({"type": "round-robin"})).unwrap();
    assert_eq!(g, Grouping::RoundRobin);
  }

  proptest! {
    #[test]
    fn test_round_robin_sends_k_to_k_mod_n(n in 1usize..32, count in 1usize..200) {
      let selector = Selector::new(Grouping::RoundRobin);
      for k in 0..count {
        prop_assert_eq!(selector.select(&json!(null), n), vec![k % n]);
      }
    }

    #[test]
    fn test_random_stays_in_range(n in 1usize..32) {
      let selector = Selector::new(Grouping::Random);
      let picks = selector.select(&json!(null), n);
      prop_assert_eq!(picks.len(), 1);
      prop_assert!(picks[0] < n);
    }

    #[test]
    fn test_fields_identical_values_route_identically(
      user in "[a-z]{1,12}",
      region in 0u32..100,
      noise_a in any::<i64>(),
      noise_b in any::<i64>(),
      n in 1usize..32,
    ) {
      let selector = Selector::new(Grouping::fields(["user", "region"]));
      let a = selector.select(&json!({"user": user, "region": region, "payload": noise_a}), n);
      let b = selector.select(&json!({"payload": noise_b, "region": region, "user": user}), n);
      prop_assert_eq!(a, b);
    }
  }
}
