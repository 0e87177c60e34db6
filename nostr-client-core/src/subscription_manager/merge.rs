//! Merge eligibility (§4.F step 1): two subscriptions may share one
//! underlying `PoolSubscription` iff their filter sequences have
//! identical `kinds` clauses, neither side pins down concrete identities,
//! and their time ranges overlap.

use nostr_proto::Filter;

pub fn mergeable(existing: &[Filter], candidate: &[Filter]) -> bool {
  if existing.len() != candidate.len() {
    return false;
  }
  existing.iter().zip(candidate.iter()).all(|(a, b)| {
    a.kinds == b.kinds && a.has_no_identity_clauses() && b.has_no_identity_clauses() && time_ranges_overlap(a, b)
  })
}

fn time_ranges_overlap(a: &Filter, b: &Filter) -> bool {
  let a_since = a.since.unwrap_or(i64::MIN);
  let a_until = a.until.unwrap_or(i64::MAX);
  let b_since = b.since.unwrap_or(i64::MIN);
  let b_until = b.until.unwrap_or(i64::MAX);
  a_since <= b_until && b_since <= a_until
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;
  use nostr_proto::EventKind;

  #[test]
  fn identical_empty_filters_are_mergeable() {
    assert!(mergeable(&[Filter::new()], &[Filter::new()]));
  }

  #[test]
  fn differing_kinds_are_not_mergeable() {
    let a = [Filter::new().with_kinds(vec![EventKind::Text])];
    let b = [Filter::new().with_kinds(vec![EventKind::Metadata])];
    assert!(!mergeable(&a, &b));
  }

  #[test]
  fn authors_clause_blocks_merge() {
    let a = [Filter::new()];
    let b = [Filter::new().with_authors(vec!["pk".to_string()])];
    assert!(!mergeable(&a, &b));
  }
}
