use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use super::Result;
use crate::TrainingError;

/// Produces the dataset indices one worker visits during an epoch.
pub trait Sampler: Send {
    fn indices(&self) -> Vec<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reseeds epoch-dependent ordering. No-op for deterministic samplers.
    fn set_epoch(&mut self, _epoch: usize) {}
}

/// Visits every index in order.
#[derive(Debug, Clone)]
pub struct SequentialSampler {
    len: usize,
}

impl SequentialSampler {
    pub fn new(len: usize) -> Self {
        Self { len }
    }
}

impl Sampler for SequentialSampler {
    fn indices(&self) -> Vec<usize> {
        (0..self.len).collect()
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Splits a dataset into disjoint, equally sized shards, one per replica.
///
/// Shuffling is seeded with `seed + epoch` so every replica derives the same
/// permutation. Without `drop_last`, the permutation is padded by repeating
/// its head until it divides evenly; with `drop_last` the tail is cut instead.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    dataset_len: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    drop_last: bool,
    epoch: usize,
    num_samples: usize,
}

impl DistributedSampler {
    pub fn new(
        dataset_len: usize,
        num_replicas: usize,
        rank: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        Self::with_drop_last(dataset_len, num_replicas, rank, shuffle, seed, false)
    }

    pub fn with_drop_last(
        dataset_len: usize,
        num_replicas: usize,
        rank: usize,
        shuffle: bool,
        seed: u64,
        drop_last: bool,
    ) -> Result<Self> {
        if num_replicas == 0 || rank >= num_replicas {
            return Err(TrainingError::initialization(format!(
                "invalid sampler rank {} for {} replicas",
                rank, num_replicas
            )));
        }
        let num_samples = if drop_last {
            dataset_len / num_replicas
        } else {
            dataset_len.div_ceil(num_replicas)
        };
        Ok(Self {
            dataset_len,
            num_replicas,
            rank,
            shuffle,
            seed,
            drop_last,
            epoch: 0,
            num_samples,
        })
    }

    pub fn total_size(&self) -> usize {
        self.num_samples * self.num_replicas
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

impl Sampler for DistributedSampler {
    fn indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.dataset_len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
            indices.shuffle(&mut rng);
        }

        let total_size = self.total_size();
        if self.drop_last {
            indices.truncate(total_size);
        } else if !indices.is_empty() {
            let mut cursor = 0;
            while indices.len() < total_size {
                indices.push(indices[cursor]);
                cursor += 1;
            }
        }

        indices
            .into_iter()
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect()
    }

    fn len(&self) -> usize {
        self.num_samples
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn shards_are_disjoint_and_cover_dataset() {
        let shards: Vec<Vec<usize>> = (0..4)
            .map(|rank| {
                DistributedSampler::new(16, 4, rank, true, 7)
                    .unwrap()
                    .indices()
            })
            .collect();
        let mut seen = BTreeSet::new();
        for shard in &shards {
            assert_eq!(shard.len(), 4);
            for index in shard {
                assert!(seen.insert(*index), "index {} assigned twice", index);
            }
        }
        assert_eq!(seen.len(), 16);
    }

    #[test]
    fn epoch_changes_permutation_deterministically() {
        let mut sampler = DistributedSampler::new(32, 2, 1, true, 0).unwrap();
        let first = sampler.indices();
        assert_eq!(first, sampler.indices());
        sampler.set_epoch(1);
        let second = sampler.indices();
        assert_ne!(first, second);
        sampler.set_epoch(0);
        assert_eq!(first, sampler.indices());
    }

    #[test]
    fn pads_by_repeating_head() {
        let shards: Vec<Vec<usize>> = (0..3)
            .map(|rank| {
                DistributedSampler::new(7, 3, rank, false, 0)
                    .unwrap()
                    .indices()
            })
            .collect();
        assert_eq!(shards[0], vec![0, 3, 6]);
        assert_eq!(shards[1], vec![1, 4, 0]);
        assert_eq!(shards[2], vec![2, 5, 1]);
    }

    #[test]
    fn drop_last_truncates_tail() {
        let sampler = DistributedSampler::with_drop_last(7, 3, 2, false, 0, true).unwrap();
        assert_eq!(sampler.len(), 2);
        assert_eq!(sampler.indices(), vec![2, 5]);
    }

    #[test]
    fn sequential_sampler_is_ordered() {
        assert_eq!(SequentialSampler::new(4).indices(), vec![0, 1, 2, 3]);
    }
}
