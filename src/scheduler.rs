//! Mutual-exclusion scheduling for overlapping chunk work. A chunk may only
//! run while none of its 26 spatial neighbors is running, enforced through a
//! corner-keyed lock table.

use crate::bbox::{Bbox, Vec3};
use crate::error::{Result, VoxError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Pause between retries while a foreign lock holder blocks progress
const STALL_BACKOFF: Duration = Duration::from_millis(2);

const DEFAULT_STALL_LIMIT: usize = 500;

/// Outcome of a lock acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Acquired,
    /// Some key was already held by another owner; nothing was acquired.
    Conflict { key: Vec3, holder: Vec3 },
}

/// Corner-keyed lock table. Owners are chunk corners too, so the table is a
/// plain corner -> corner map. Kept behind its own handle so schedulers can
/// share one table; a strongly consistent external table could stand in for
/// it without changing the scheduling logic.
#[derive(Default)]
pub struct LockTable {
    locks: Mutex<HashMap<Vec3, Vec3>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires every key for `owner` or none of them. Keys are taken in
    /// sorted order and already-acquired keys are released on the first
    /// foreign conflict, so two overlapping acquisitions cannot deadlock.
    pub fn atomic_lock(&self, keys: &[Vec3], owner: Vec3) -> Acquire {
        let mut sorted = keys.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut held = self.locks.lock();
        let mut taken = Vec::new();
        for &key in &sorted {
            match held.get(&key) {
                Some(&holder) if holder != owner => {
                    for t in taken {
                        held.remove(&t);
                    }
                    return Acquire::Conflict { key, holder };
                }
                Some(_) => {}
                None => {
                    held.insert(key, owner);
                    taken.push(key);
                }
            }
        }
        Acquire::Acquired
    }

    /// Releases every key held by `owner` among `keys`.
    pub fn atomic_unlock(&self, keys: &[Vec3], owner: Vec3) {
        let mut held = self.locks.lock();
        for key in keys {
            if held.get(key) == Some(&owner) {
                held.remove(key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

/// Drives chunk work over a grid so that no two spatially adjacent chunks are
/// ever in progress at once. Chunks move through three disjoint states:
/// not started, in progress (neighborhood locked), finished.
pub struct SpatialLockScheduler {
    locks: Arc<LockTable>,
    offset: Vec3,
    bound: Vec3,
    chunk_size: Vec3,
    not_started: HashSet<Vec3>,
    in_progress: HashSet<Vec3>,
    finished: HashSet<Vec3>,
    stall_limit: usize,
}

impl SpatialLockScheduler {
    pub fn new(bounds: &Bbox, chunk_size: Vec3, locks: Arc<LockTable>) -> Self {
        let mut not_started = HashSet::new();
        let mut x = bounds.minpt.x;
        while x < bounds.maxpt.x {
            let mut y = bounds.minpt.y;
            while y < bounds.maxpt.y {
                let mut z = bounds.minpt.z;
                while z < bounds.maxpt.z {
                    not_started.insert(Vec3::new(x, y, z));
                    z += chunk_size.z;
                }
                y += chunk_size.y;
            }
            x += chunk_size.x;
        }
        Self {
            locks,
            offset: bounds.minpt,
            bound: bounds.maxpt,
            chunk_size,
            not_started,
            in_progress: HashSet::new(),
            finished: HashSet::new(),
            stall_limit: DEFAULT_STALL_LIMIT,
        }
    }

    /// Caps how many consecutive conflicts against a foreign lock holder
    /// [`SpatialLockScheduler::run`] tolerates before giving up.
    pub fn with_stall_limit(mut self, stall_limit: usize) -> Self {
        self.stall_limit = stall_limit;
        self
    }

    /// The corner and its 26 spatial neighbors. Neighbors outside the grid
    /// are locked too; they are harmless and keep the logic uniform.
    pub fn neighbors(&self, corner: Vec3) -> Vec<Vec3> {
        let mut out = Vec::with_capacity(27);
        for i in -1..=1 {
            for j in -1..=1 {
                for k in -1..=1 {
                    out.push(Vec3::new(
                        corner.x + i * self.chunk_size.x,
                        corner.y + j * self.chunk_size.y,
                        corner.z + k * self.chunk_size.z,
                    ));
                }
            }
        }
        out
    }

    /// Chunk box at a corner, clipped to the grid bound
    pub fn chunk_at(&self, corner: Vec3) -> Bbox {
        Bbox::new(corner, (corner + self.chunk_size).min2(self.bound))
    }

    /// Attempts to move a not-started chunk into progress by locking its
    /// whole neighborhood.
    pub fn schedule(&mut self, corner: Vec3) -> Result<Acquire> {
        if !self.not_started.contains(&corner) {
            return Err(VoxError::Task(format!(
                "chunk {} is not eligible for scheduling",
                corner
            )));
        }
        match self.locks.atomic_lock(&self.neighbors(corner), corner) {
            Acquire::Acquired => {
                self.not_started.remove(&corner);
                self.in_progress.insert(corner);
                tracing::debug!(corner = %corner, "scheduled chunk");
                Ok(Acquire::Acquired)
            }
            conflict => Ok(conflict),
        }
    }

    /// Releases an in-progress chunk's neighborhood and marks it finished.
    pub fn finish(&mut self, corner: Vec3) -> Result<()> {
        if !self.in_progress.remove(&corner) {
            return Err(VoxError::Task(format!(
                "chunk {} is not in progress",
                corner
            )));
        }
        self.locks.atomic_unlock(&self.neighbors(corner), corner);
        self.finished.insert(corner);
        tracing::debug!(corner = %corner, "finished chunk");
        Ok(())
    }

    fn finish_any(&mut self) -> Result<bool> {
        match self.in_progress.iter().next().copied() {
            Some(corner) => {
                self.finish(corner)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remaining(&self) -> usize {
        self.not_started.len() + self.in_progress.len()
    }

    /// Runs `work` once for every chunk of the grid. Work happens while the
    /// chunk's neighborhood is locked; the chunk stays in progress until a
    /// later conflict (or the drain at the end) releases it, so neighbors
    /// observe the exclusion for as long as possible.
    ///
    /// Liveness rests on a heuristic: when a schedule attempt conflicts, one
    /// arbitrary in-progress chunk is finished, which always frees lock keys
    /// as long as conflicts come from this scheduler's own chunks. A conflict
    /// held by a foreign owner on a shared table leaves nothing to finish
    /// locally; those stalls back off briefly and, past the stall limit, turn
    /// into an error instead of spinning until the holder releases.
    pub fn run<F>(&mut self, mut work: F) -> Result<()>
    where
        F: FnMut(&Bbox) -> Result<()>,
    {
        let total = self.not_started.len() + self.in_progress.len() + self.finished.len();
        let mut stalls = 0usize;
        while self.finished.len() < total {
            match self.not_started.iter().next().copied() {
                Some(corner) => match self.schedule(corner)? {
                    Acquire::Acquired => {
                        stalls = 0;
                        let chunk = self.chunk_at(corner);
                        work(&chunk)?;
                    }
                    Acquire::Conflict { key, holder } => {
                        if self.finish_any()? {
                            stalls = 0;
                        } else {
                            stalls += 1;
                            if stalls > self.stall_limit {
                                return Err(VoxError::Task(format!(
                                    "lock {} held by foreign owner {}, no local progress possible",
                                    key, holder
                                )));
                            }
                            std::thread::sleep(STALL_BACKOFF);
                        }
                    }
                },
                None => {
                    self.finish_any()?;
                }
            }
        }
        Ok(())
    }

    /// Offset of the grid this scheduler covers
    pub fn grid_bounds(&self) -> Bbox {
        Bbox::new(self.offset, self.bound)
    }
}
