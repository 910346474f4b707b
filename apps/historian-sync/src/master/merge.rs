use crate::types::{Sample, SampleKey};
use std::collections::BTreeMap;

/// Concatenates `existing` and `new`, keeps the last sample per `(unit, tag, time)`,
/// and returns the result ordered by `(time, unit, tag)`.
pub fn merge_samples(existing: Vec<Sample>, new: Vec<Sample>) -> Vec<Sample> {
    let mut by_key: BTreeMap<SampleKey, Sample> = BTreeMap::new();
    for sample in existing.into_iter().chain(new) {
        by_key.insert(sample.key(), sample);
    }
    by_key.into_values().collect()
}
