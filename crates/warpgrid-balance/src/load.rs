//! Load vectors and running load statistics.

use std::ops::{AddAssign, SubAssign};

use serde::{Deserialize, Serialize};

/// A flat vector of integer loads, one slot per metric index.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoadEntry {
    values: Vec<i64>,
}

impl LoadEntry {
    pub fn zeros(len: usize) -> Self {
        Self {
            values: vec![0; len],
        }
    }

    pub fn from_values(values: Vec<i64>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> i64 {
        self.values[index]
    }

    pub fn set(&mut self, index: usize, value: i64) {
        self.values[index] = value;
    }

    pub fn add(&mut self, index: usize, delta: i64) {
        self.values[index] += delta;
    }

    pub fn values(&self) -> &[i64] {
        &self.values
    }

    /// Indices with a non-zero value.
    pub fn non_zero(&self) -> impl Iterator<Item = (usize, i64)> + '_ {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0)
            .map(|(i, v)| (i, *v))
    }
}

impl AddAssign<&LoadEntry> for LoadEntry {
    fn add_assign(&mut self, rhs: &LoadEntry) {
        assert_eq!(self.values.len(), rhs.values.len(), "load entry length mismatch");
        for (lhs, rhs) in self.values.iter_mut().zip(&rhs.values) {
            *lhs += rhs;
        }
    }
}

impl SubAssign<&LoadEntry> for LoadEntry {
    fn sub_assign(&mut self, rhs: &LoadEntry) {
        assert_eq!(self.values.len(), rhs.values.len(), "load entry length mismatch");
        for (lhs, rhs) in self.values.iter_mut().zip(&rhs.values) {
            *lhs -= rhs;
        }
    }
}

/// Running statistics for one metric over a set of nodes.
///
/// Sums are maintained incrementally. Min/max cannot be maintained under
/// removal, so they are flagged stale and recomputed by the owner.
#[derive(Debug, Clone, Default)]
pub struct LoadStat {
    pub count: usize,
    /// Sum of raw loads.
    pub absolute_sum: f64,
    /// Sum of scaled loads (load / capacity ratio, or load / capacity when
    /// balancing by percentage).
    pub sum: f64,
    pub sum_squares: f64,
    pub capacity_sum: f64,
    /// Every counted node has a positive capacity.
    pub capacity_complete: bool,
    pub min: f64,
    pub max: f64,
    extremes_stale: bool,
}

impl LoadStat {
    pub fn new() -> Self {
        Self {
            capacity_complete: true,
            ..Self::default()
        }
    }

    pub fn add_node(&mut self, load: i64, scaled: f64, capacity: i64) {
        if self.count == 0 {
            self.min = scaled;
            self.max = scaled;
        } else {
            self.min = self.min.min(scaled);
            self.max = self.max.max(scaled);
        }
        self.count += 1;
        self.absolute_sum += load as f64;
        self.sum += scaled;
        self.sum_squares += scaled * scaled;
        if capacity > 0 {
            self.capacity_sum += capacity as f64;
        } else {
            self.capacity_complete = false;
        }
    }

    /// Replace one node's contribution.
    pub fn update_node(&mut self, old_load: i64, new_load: i64, old_scaled: f64, new_scaled: f64) {
        self.absolute_sum += (new_load - old_load) as f64;
        self.sum += new_scaled - old_scaled;
        self.sum_squares += new_scaled * new_scaled - old_scaled * old_scaled;
        if new_scaled > self.max {
            self.max = new_scaled;
        } else if old_scaled == self.max && new_scaled < old_scaled {
            self.extremes_stale = true;
        }
        if new_scaled < self.min {
            self.min = new_scaled;
        } else if old_scaled == self.min && new_scaled > old_scaled {
            self.extremes_stale = true;
        }
    }

    pub fn extremes_stale(&self) -> bool {
        self.extremes_stale
    }

    pub fn set_extremes(&mut self, min: f64, max: f64) {
        self.min = min;
        self.max = max;
        self.extremes_stale = false;
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Coefficient of variation of the scaled loads. Zero when the average is
    /// zero, i.e. an idle metric is perfectly balanced.
    pub fn normalized_std_dev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let n = self.count as f64;
        let average = self.sum / n;
        if average <= 0.0 {
            return 0.0;
        }
        let variance = (self.sum_squares / n - average * average).max(0.0);
        variance.sqrt() / average
    }

    /// Std dev of the scaled loads around `target`, normalized by `target`.
    pub fn normalized_std_dev_around(&self, target: f64) -> f64 {
        if self.count == 0 || target <= 0.0 {
            return 0.0;
        }
        let n = self.count as f64;
        let variance =
            (self.sum_squares / n - 2.0 * target * self.sum / n + target * target).max(0.0);
        variance.sqrt() / target
    }
}

/// Normalized std dev of a plain list of values.
pub fn normalized_std_dev(values: &[f64]) -> f64 {
    let mut stat = LoadStat::new();
    for &value in values {
        stat.add_node(0, value, 0);
    }
    stat.normalized_std_dev()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_entry_arithmetic() {
        let mut a = LoadEntry::from_values(vec![1, 2, 3]);
        let b = LoadEntry::from_values(vec![10, 0, -3]);
        a += &b;
        assert_eq!(a.values(), &[11, 2, 0]);
        a -= &b;
        assert_eq!(a.values(), &[1, 2, 3]);
        assert_eq!(b.non_zero().collect::<Vec<_>>(), vec![(0, 10), (2, -3)]);
    }

    #[test]
    #[should_panic(expected = "length mismatch")]
    fn load_entry_length_mismatch_panics() {
        let mut a = LoadEntry::zeros(2);
        a += &LoadEntry::zeros(3);
    }

    #[test]
    fn std_dev_of_uniform_loads_is_zero() {
        assert_eq!(normalized_std_dev(&[50.0, 50.0, 50.0]), 0.0);
        assert_eq!(normalized_std_dev(&[0.0, 0.0]), 0.0);
    }

    #[test]
    fn incremental_update_matches_rebuild() {
        let mut stat = LoadStat::new();
        for load in [10, 50, 90] {
            stat.add_node(load, load as f64, 100);
        }
        stat.update_node(90, 50, 90.0, 50.0);
        stat.update_node(10, 50, 10.0, 50.0);
        assert!(stat.normalized_std_dev().abs() < 1e-9);
        assert!(stat.extremes_stale());
        assert_eq!(stat.absolute_sum, 150.0);
    }

    #[test]
    fn std_dev_around_target() {
        let mut stat = LoadStat::new();
        stat.add_node(25, 0.25, 100);
        stat.add_node(75, 0.75, 100);
        let target = stat.absolute_sum / stat.capacity_sum;
        assert!((stat.normalized_std_dev_around(target) - 0.5).abs() < 1e-9);
        assert!(stat.capacity_complete);
    }
}
