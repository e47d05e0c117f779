//! In-process process group: one thread per rank, sharing a slot table.

use std::sync::{Arc, Barrier};

use parking_lot::Mutex;

use super::{Collective, DistributedContext};
use crate::TrainingError;

struct Shared {
    slots: Mutex<Vec<Vec<f64>>>,
    barrier: Barrier,
}

/// Member handle of an in-process group. Each rank must be driven from its
/// own thread, otherwise the first collective deadlocks.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Creates one handle per rank, ordered by rank.
    pub fn new(world_size: usize) -> Vec<LocalGroup> {
        let world_size = world_size.max(1);
        let shared = Arc::new(Shared {
            slots: Mutex::new(vec![Vec::new(); world_size]),
            barrier: Barrier::new(world_size),
        });
        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// Convenience wrapper returning ready-to-use contexts on the CPU.
    pub fn contexts(world_size: usize) -> Vec<DistributedContext> {
        Self::new(world_size)
            .into_iter()
            .map(|member| {
                let rank = member.rank;
                let world_size = member.world_size;
                DistributedContext::new(rank, world_size, Arc::new(member))
            })
            .collect()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    fn publish(&self, values: &[f64]) {
        let mut slots = self.shared.slots.lock();
        slots[self.rank].clear();
        slots[self.rank].extend_from_slice(values);
    }
}

impl Collective for LocalGroup {
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), TrainingError> {
        self.publish(values);
        self.shared.barrier.wait();
        let outcome = {
            let slots = self.shared.slots.lock();
            if slots.iter().any(|slot| slot.len() != values.len()) {
                Err(TrainingError::collective(
                    "ranks contributed buffers of different lengths",
                ))
            } else {
                // Same summation order on every rank keeps results identical.
                for (index, value) in values.iter_mut().enumerate() {
                    *value = slots.iter().fold(0.0, |acc, slot| acc + slot[index]);
                }
                Ok(())
            }
        };
        self.shared.barrier.wait();
        outcome
    }

    fn broadcast(&self, values: &mut [f64]) -> Result<(), TrainingError> {
        if self.rank == 0 {
            self.publish(values);
        }
        self.shared.barrier.wait();
        let outcome = {
            let slots = self.shared.slots.lock();
            if slots[0].len() != values.len() {
                Err(TrainingError::collective(format!(
                    "broadcast expected {} values but rank 0 sent {}",
                    values.len(),
                    slots[0].len()
                )))
            } else {
                values.copy_from_slice(&slots[0]);
                Ok(())
            }
        };
        self.shared.barrier.wait();
        outcome
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        self.shared.barrier.wait();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn all_reduce_mean_matches_across_ranks() {
        let handles: Vec<_> = LocalGroup::contexts(3)
            .into_iter()
            .map(|ctx| {
                thread::spawn(move || {
                    let value = 0.1 * (ctx.rank() as f64 + 1.0);
                    ctx.all_reduce_mean(value).unwrap()
                })
            })
            .collect();
        let results: Vec<f64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!((results[0] - 0.2).abs() < 1e-12);
        assert!(results
            .iter()
            .all(|value| value.to_bits() == results[0].to_bits()));
    }

    #[test]
    fn broadcast_overwrites_with_rank_zero() {
        let handles: Vec<_> = LocalGroup::contexts(2)
            .into_iter()
            .map(|ctx| {
                thread::spawn(move || {
                    let mut values = vec![ctx.rank() as f64; 4];
                    ctx.broadcast_from_main(&mut values).unwrap();
                    values
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![0.0; 4]);
        }
    }
}
