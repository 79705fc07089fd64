//! Inverted index from (column-name, column-value) to partition-ID bitmaps.
//!
//! Partitions are identified by dense integer IDs so that group membership,
//! pending-flush tracking, eviction and query intersection all reduce to
//! compressed-bitmap set algebra.

use crate::label::unmarshal_series_key;
use crate::Result;
use roaring::RoaringBitmap;
use std::collections::{BTreeMap, HashMap};

/// A filter over partition-key columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterExpr {
    Eq { column: String, value: String },
    In { column: String, values: Vec<String> },
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
}

/// Outcome of evaluating filters against the index.
///
/// `ids: None` means the resolvable part of the filter did not constrain the
/// result (match everything live). `residuals` are the sub-filters the index
/// could not resolve; the caller applies them downstream.
pub struct FilterMatch {
    pub ids: Option<RoaringBitmap>,
    pub residuals: Vec<FilterExpr>,
}

/// Inverted partition-key index.
pub struct PartitionKeyIndex {
    postings: HashMap<String, BTreeMap<Vec<u8>, RoaringBitmap>>,
    entries: usize,
}

impl PartitionKeyIndex {
    pub fn new() -> Self {
        Self {
            postings: HashMap::new(),
            entries: 0,
        }
    }

    /// Decomposes a binary partition key and inserts `id` into every
    /// (name, value) posting list.
    pub fn add_key(&mut self, bin_key: &[u8], id: u32) -> Result<()> {
        for label in unmarshal_series_key(bin_key)? {
            let entries = &mut self.entries;
            let values = self.postings.entry(label.name).or_default();
            let posting = values.entry(label.value.into_bytes()).or_insert_with(|| {
                *entries += 1;
                RoaringBitmap::new()
            });
            posting.insert(id);
        }
        Ok(())
    }

    /// Subtracts `ids` from the posting lists of the given values under one
    /// column name, deleting entries that become empty.
    pub fn remove_entries(&mut self, name: &str, values: &[Vec<u8>], ids: &RoaringBitmap) {
        let Some(value_map) = self.postings.get_mut(name) else {
            return;
        };

        for value in values {
            if let Some(posting) = value_map.get_mut(value) {
                *posting -= ids;
                if posting.is_empty() {
                    value_map.remove(value);
                    self.entries -= 1;
                }
            }
        }

        if value_map.is_empty() {
            self.postings.remove(name);
        }
    }

    /// Subtracts `ids` from every posting list in the index. Used by the
    /// eviction controller.
    pub fn remove_ids(&mut self, ids: &RoaringBitmap) {
        let names: Vec<String> = self.postings.keys().cloned().collect();
        for name in names {
            let values: Vec<Vec<u8>> = self
                .postings
                .get(&name)
                .map(|m| {
                    m.iter()
                        .filter(|(_, bm)| !bm.is_disjoint(ids))
                        .map(|(v, _)| v.clone())
                        .collect()
                })
                .unwrap_or_default();
            if !values.is_empty() {
                self.remove_entries(&name, &values, ids);
            }
        }
    }

    /// Posting list for an exact (column, value) pair.
    pub fn lookup(&self, column: &str, value: &[u8]) -> Option<&RoaringBitmap> {
        self.postings.get(column)?.get(value)
    }

    /// All indexed column names.
    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.postings.keys().cloned().collect();
        names.sort();
        names
    }

    /// All indexed values for one column name.
    pub fn index_values(&self, name: &str) -> Vec<Vec<u8>> {
        self.postings
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of live (name, value) posting lists.
    pub fn entry_count(&self) -> usize {
        self.entries
    }

    /// Approximate resident size of the index in bytes.
    pub fn approximate_bytes(&self) -> usize {
        self.postings
            .iter()
            .map(|(name, values)| {
                name.len()
                    + values
                        .iter()
                        .map(|(v, bm)| v.len() + bm.serialized_size())
                        .sum::<usize>()
            })
            .sum()
    }

    /// Evaluates `filters` (implicitly AND-ed) over the index.
    pub fn parse_filters(&self, filters: &[FilterExpr]) -> FilterMatch {
        let mut ids: Option<RoaringBitmap> = None;
        let mut residuals = Vec::new();

        for filter in filters {
            match self.evaluate(filter) {
                Some(matched) => {
                    ids = Some(match ids {
                        Some(mut acc) => {
                            acc &= &matched;
                            acc
                        }
                        None => matched,
                    });
                }
                None => residuals.push(filter.clone()),
            }
        }

        FilterMatch { ids, residuals }
    }

    /// Evaluates one filter; `None` means the index cannot resolve it.
    fn evaluate(&self, filter: &FilterExpr) -> Option<RoaringBitmap> {
        match filter {
            FilterExpr::Eq { column, value } => {
                self.postings.get(column).map(|values| {
                    values
                        .get(value.as_bytes())
                        .cloned()
                        .unwrap_or_default()
                })
            }
            FilterExpr::In { column, values } => {
                let value_map = self.postings.get(column)?;
                let mut acc = RoaringBitmap::new();
                for value in values {
                    if let Some(posting) = value_map.get(value.as_bytes()) {
                        acc |= posting;
                    }
                }
                Some(acc)
            }
            FilterExpr::And(children) => {
                // Unresolvable conjuncts would have to become residuals of
                // the parent; an AND nested under OR cannot carry them, so
                // resolve fully or not at all.
                let mut acc: Option<RoaringBitmap> = None;
                for child in children {
                    let matched = self.evaluate(child)?;
                    acc = Some(match acc {
                        Some(mut a) => {
                            a &= &matched;
                            a
                        }
                        None => matched,
                    });
                }
                acc.or_else(|| Some(RoaringBitmap::new()))
            }
            FilterExpr::Or(children) => {
                let mut acc = RoaringBitmap::new();
                for child in children {
                    acc |= &self.evaluate(child)?;
                }
                Some(acc)
            }
        }
    }

    /// Clears the index.
    pub fn clear(&mut self) {
        self.postings.clear();
        self.entries = 0;
    }
}

impl Default for PartitionKeyIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::{marshal_series_key, Label};

    fn key(pairs: &[(&str, &str)]) -> Vec<u8> {
        let labels: Vec<Label> = pairs.iter().map(|(n, v)| Label::new(*n, *v)).collect();
        marshal_series_key(&labels).unwrap()
    }

    fn sample_index() -> PartitionKeyIndex {
        let mut index = PartitionKeyIndex::new();
        index
            .add_key(&key(&[("host", "web-1"), ("dc", "ams")]), 1)
            .unwrap();
        index
            .add_key(&key(&[("host", "web-2"), ("dc", "ams")]), 2)
            .unwrap();
        index
            .add_key(&key(&[("host", "web-1"), ("dc", "fra")]), 3)
            .unwrap();
        index
    }

    fn ids(bm: &RoaringBitmap) -> Vec<u32> {
        bm.iter().collect()
    }

    #[test]
    fn eq_filter_matches_posting() {
        let index = sample_index();
        let m = index.parse_filters(&[FilterExpr::Eq {
            column: "host".into(),
            value: "web-1".into(),
        }]);
        assert_eq!(ids(&m.ids.unwrap()), vec![1, 3]);
        assert!(m.residuals.is_empty());
    }

    #[test]
    fn and_intersects() {
        let index = sample_index();
        let m = index.parse_filters(&[
            FilterExpr::Eq {
                column: "host".into(),
                value: "web-1".into(),
            },
            FilterExpr::Eq {
                column: "dc".into(),
                value: "ams".into(),
            },
        ]);
        assert_eq!(ids(&m.ids.unwrap()), vec![1]);
    }

    #[test]
    fn in_filter_unions_values() {
        let index = sample_index();
        let m = index.parse_filters(&[FilterExpr::In {
            column: "host".into(),
            values: vec!["web-1".into(), "web-2".into()],
        }]);
        assert_eq!(ids(&m.ids.unwrap()), vec![1, 2, 3]);
    }

    #[test]
    fn or_of_eqs() {
        let index = sample_index();
        let m = index.parse_filters(&[FilterExpr::Or(vec![
            FilterExpr::Eq {
                column: "dc".into(),
                value: "fra".into(),
            },
            FilterExpr::Eq {
                column: "host".into(),
                value: "web-2".into(),
            },
        ])]);
        assert_eq!(ids(&m.ids.unwrap()), vec![2, 3]);
    }

    #[test]
    fn unknown_column_becomes_residual() {
        let index = sample_index();
        let residual = FilterExpr::Eq {
            column: "pod".into(),
            value: "x".into(),
        };
        let m = index.parse_filters(&[
            residual.clone(),
            FilterExpr::Eq {
                column: "dc".into(),
                value: "ams".into(),
            },
        ]);
        assert_eq!(ids(&m.ids.unwrap()), vec![1, 2]);
        assert_eq!(m.residuals, vec![residual]);
    }

    #[test]
    fn known_column_unknown_value_matches_nothing() {
        let index = sample_index();
        let m = index.parse_filters(&[FilterExpr::Eq {
            column: "host".into(),
            value: "web-9".into(),
        }]);
        assert!(m.ids.unwrap().is_empty());
        assert!(m.residuals.is_empty());
    }

    #[test]
    fn remove_entries_drops_empty_postings() {
        let mut index = sample_index();
        let mut evicted = RoaringBitmap::new();
        evicted.insert(2);

        index.remove_entries("host", &[b"web-2".to_vec()], &evicted);
        assert!(index.lookup("host", b"web-2").is_none());
        // Other postings untouched.
        assert_eq!(ids(index.lookup("host", b"web-1").unwrap()), vec![1, 3]);
    }

    #[test]
    fn remove_ids_sweeps_all_columns() {
        let mut index = sample_index();
        let before = index.entry_count();

        let mut evicted = RoaringBitmap::new();
        evicted.insert(3);
        index.remove_ids(&evicted);

        // (host, web-1) keeps id 1, (dc, fra) disappears entirely.
        assert_eq!(ids(index.lookup("host", b"web-1").unwrap()), vec![1]);
        assert!(index.lookup("dc", b"fra").is_none());
        assert_eq!(index.entry_count(), before - 1);
    }

    #[test]
    fn enumeration_is_sorted_and_complete() {
        let index = sample_index();
        assert_eq!(index.index_names(), vec!["dc".to_string(), "host".to_string()]);
        assert_eq!(
            index.index_values("host"),
            vec![b"web-1".to_vec(), b"web-2".to_vec()]
        );
    }

    #[test]
    fn size_accounting_tracks_entries() {
        let mut index = sample_index();
        assert_eq!(index.entry_count(), 4);
        assert!(index.approximate_bytes() > 0);
        index.clear();
        assert_eq!(index.entry_count(), 0);
        assert_eq!(index.approximate_bytes(), 0);
    }
}
