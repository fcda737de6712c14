//! Organ model view
//!
//! The engine only needs the shape of the instrument: how many windchests
//! and tremulants exist, and each windchest's enclosure volume. Everything
//! else (stops, ranks, couplers) stays in the loader's domain.

use pf_core::Sample;

/// Read-only organ description consumed at engine build time
pub trait OrganModel: Send + Sync {
    fn windchest_count(&self) -> usize;

    fn tremulant_count(&self) -> usize;

    /// Enclosure-derived volume of a windchest (1-based index matching the
    /// windchest task IDs; index 0 is the detached-release windchest and is
    /// not part of the model).
    fn windchest_volume(&self, windchest_n: usize) -> Sample;

    /// Tremulant indices (0-based) modulating a windchest.
    fn windchest_tremulants(&self, windchest_n: usize) -> Vec<usize>;
}

/// Plain organ description with fixed windchest volumes
#[derive(Debug, Clone)]
pub struct SimpleOrganModel {
    windchest_volumes: Vec<Sample>,
    tremulant_count: usize,
    windchest_tremulants: Vec<Vec<usize>>,
}

impl SimpleOrganModel {
    pub fn new(windchest_volumes: Vec<Sample>, tremulant_count: usize) -> Self {
        let n = windchest_volumes.len();
        Self {
            windchest_volumes,
            tremulant_count,
            windchest_tremulants: vec![Vec::new(); n],
        }
    }

    /// One full-volume windchest, no tremulants.
    pub fn single_windchest() -> Self {
        Self::new(vec![1.0], 0)
    }

    /// Attach a tremulant to a windchest (both already counted in `new`).
    pub fn with_windchest_tremulant(mut self, windchest_n: usize, tremulant: usize) -> Self {
        assert!(windchest_n >= 1 && windchest_n <= self.windchest_tremulants.len());
        assert!(tremulant < self.tremulant_count);
        self.windchest_tremulants[windchest_n - 1].push(tremulant);
        self
    }
}

impl OrganModel for SimpleOrganModel {
    fn windchest_count(&self) -> usize {
        self.windchest_volumes.len()
    }

    fn tremulant_count(&self) -> usize {
        self.tremulant_count
    }

    fn windchest_volume(&self, windchest_n: usize) -> Sample {
        self.windchest_volumes
            .get(windchest_n.wrapping_sub(1))
            .copied()
            .unwrap_or(1.0)
    }

    fn windchest_tremulants(&self, windchest_n: usize) -> Vec<usize> {
        self.windchest_tremulants
            .get(windchest_n.wrapping_sub(1))
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_model_counts() {
        let model = SimpleOrganModel::new(vec![1.0, 0.5], 1);
        assert_eq!(model.windchest_count(), 2);
        assert_eq!(model.tremulant_count(), 1);
        assert_eq!(model.windchest_volume(2), 0.5);
        // Out-of-range (including the detached index 0) reads full volume.
        assert_eq!(model.windchest_volume(0), 1.0);
        assert_eq!(model.windchest_volume(9), 1.0);
    }
}
