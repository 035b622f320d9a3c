use crate::{packet::Pid, Result};
use std::{collections::BTreeMap, convert::TryFrom};

/// Hands out packet identifiers from a bounded range.
///
/// Always returns the lowest free identifier, so a released identifier is
/// the next one handed out if nothing lower is free.
#[derive(Debug)]
pub struct PidAllocator {
    /// A map of non-overlapping free intervals where the key is the
    /// inclusive lower bound and the value is the inclusive upper
    /// bound.
    free: BTreeMap<u16, u16>,

    /// Inclusive lower bound of available pids.
    lb: u16,

    /// Inclusive upper bound of available pids.
    ub: u16,

    /// Number of pids currently held.
    in_use: usize,
}

impl PidAllocator {
    /// Returns a new instance with all pids available.
    pub fn new() -> PidAllocator {
        Self::with_bounds(1, u16::MAX)
    }

    /// Returns a new instance handing out pids in `lb..=ub`.
    ///
    /// Panics if `lb` is 0 or greater than `ub`.
    pub fn with_bounds(lb: u16, ub: u16) -> PidAllocator {
        assert!(lb <= ub, "lb <= ub");
        assert!(lb >= 1, "lb >= 1");
        let mut free = BTreeMap::new();
        free.insert(lb, ub);
        PidAllocator { free, lb, ub, in_use: 0 }
    }

    /// Inclusive upper bound of the range.
    pub fn upper_bound(&self) -> u16 {
        self.ub
    }

    /// Number of identifiers currently held.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Returns true if no pid is free.
    pub fn is_exhausted(&self) -> bool {
        self.free.is_empty()
    }

    /// Marks every pid free again.
    pub fn clear(&mut self) {
        self.free.clear();
        self.free.insert(self.lb, self.ub);
        self.in_use = 0;
    }

    /// Allocates the lowest free pid, or returns `None` when the range is exhausted.
    pub fn allocate(&mut self) -> Option<Pid> {
        let (lb, ub) = self.free.iter().next().map(|(l, u)| (*l, *u))?;
        self.free.remove(&lb);
        if ub > lb {
            self.free.insert(lb + 1, ub);
        }
        self.in_use += 1;
        Pid::try_from(lb).ok()
    }

    /// Returns true if `pid` is inside the range and currently held.
    pub fn is_held(&self, pid: Pid) -> bool {
        self.contains(pid.get()) && self.free_range_containing(pid.get()).is_none()
    }

    /// Marks a specific pid as held, e.g. when restoring a stored exchange.
    ///
    /// Fails if the pid is outside the range or already held.
    pub fn reserve(&mut self, pid: Pid) -> Result<()> {
        let x = pid.get();
        self.check_bounds(x)?;
        let (lb, ub) = match self.free_range_containing(x) {
            Some(r) => r,
            None => return Err(format!("Pid {} is already in use", x).into()),
        };
        self.free.remove(&lb);
        if lb < x {
            self.free.insert(lb, x - 1);
        }
        if x < ub {
            self.free.insert(x + 1, ub);
        }
        self.in_use += 1;
        Ok(())
    }

    /// Returns a held pid to the free set.
    ///
    /// Fails if the pid was not held.
    pub fn release(&mut self, pid: Pid) -> Result<()> {
        let x = pid.get();
        self.check_bounds(x)?;
        if self.free_range_containing(x).is_some() {
            return Err(format!("Pid {} was not in use", x).into());
        }

        // x is held, so the closest free range below ends before x.
        let below = self.free.range(..x).next_back()
            .filter(|(_, ub)| **ub == x - 1)
            .map(|(lb, _)| *lb);
        let above = if x < self.ub {
            self.free.get(&(x + 1)).copied()
        } else {
            None
        };

        match (below, above) {
            (Some(below_lb), Some(above_ub)) => {
                self.free.remove(&(x + 1));
                self.free.insert(below_lb, above_ub);
            }
            (Some(below_lb), None) => {
                self.free.insert(below_lb, x);
            }
            (None, Some(above_ub)) => {
                self.free.remove(&(x + 1));
                self.free.insert(x, above_ub);
            }
            (None, None) => {
                self.free.insert(x, x);
            }
        }
        self.in_use -= 1;
        Ok(())
    }

    fn contains(&self, x: u16) -> bool {
        x >= self.lb && x <= self.ub
    }

    fn check_bounds(&self, x: u16) -> Result<()> {
        if self.contains(x) {
            Ok(())
        } else {
            Err(format!("Pid {} outside {}..={}", x, self.lb, self.ub).into())
        }
    }

    fn free_range_containing(&self, x: u16) -> Option<(u16, u16)> {
        self.free.range(..=x).next_back()
            .filter(|(_, ub)| **ub >= x)
            .map(|(lb, ub)| (*lb, *ub))
    }
}

impl Default for PidAllocator {
    fn default() -> PidAllocator {
        PidAllocator::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::packet::pid;
    use maplit::btreemap;
    use super::PidAllocator;

    #[test]
    fn alloc_and_release() {
        let mut l = PidAllocator::new();
        assert_eq!(l.free, btreemap!{1 => u16::MAX});

        let a = l.allocate().unwrap();
        assert_eq!(a, pid(1));
        let b = l.allocate().unwrap();
        assert_eq!(b, pid(2));
        assert_eq!(l.free, btreemap!{3 => u16::MAX});
        assert_eq!(l.in_use(), 2);

        l.release(a).unwrap();
        assert_eq!(l.free, btreemap!{1 => 1, 3 => u16::MAX});

        // The released id is the very next one handed out.
        assert_eq!(l.allocate(), Some(pid(1)));

        l.release(b).unwrap();
        assert_eq!(l.free, btreemap!{2 => u16::MAX});
        l.release(pid(1)).unwrap();
        assert_eq!(l.free, btreemap!{1 => u16::MAX});
        assert_eq!(l.in_use(), 0);
    }

    #[test]
    fn exhausted() {
        let mut l = PidAllocator::with_bounds(1, 2);
        assert_eq!(l.allocate(), Some(pid(1)));
        assert_eq!(l.allocate(), Some(pid(2)));
        assert_eq!(l.allocate(), None);
        assert_eq!(l.free, btreemap!{});
        assert!(l.is_exhausted());

        l.release(pid(2)).unwrap();
        assert_eq!(l.allocate(), Some(pid(2)));
    }

    #[test]
    fn release_merges_neighbours() {
        let mut l = PidAllocator::new();
        for _ in 0..4 {
            l.allocate().unwrap();
        }
        l.release(pid(1)).unwrap();
        l.release(pid(3)).unwrap();
        assert_eq!(l.free, btreemap!{1 => 1, 3 => 3, 5 => u16::MAX});
        l.release(pid(4)).unwrap();
        assert_eq!(l.free, btreemap!{1 => 1, 3 => u16::MAX});
        l.release(pid(2)).unwrap();
        assert_eq!(l.free, btreemap!{1 => u16::MAX});
    }

    #[test]
    fn release_unheld_fails() {
        let mut l = PidAllocator::new();
        assert!(l.release(pid(1)).is_err());
        assert!(l.release(pid(u16::MAX)).is_err());

        let mut l = PidAllocator::with_bounds(5, 10);
        assert!(l.release(pid(1)).is_err());
        assert!(l.release(pid(11)).is_err());
        assert_eq!(l.in_use(), 0);
    }

    #[test]
    fn reserve_splits_range() {
        let mut l = PidAllocator::with_bounds(1, 10);
        l.reserve(pid(4)).unwrap();
        assert_eq!(l.free, btreemap!{1 => 3, 5 => 10});
        assert!(l.is_held(pid(4)));
        assert!(l.reserve(pid(4)).is_err());

        l.reserve(pid(1)).unwrap();
        l.reserve(pid(10)).unwrap();
        assert_eq!(l.free, btreemap!{2 => 3, 5 => 9});
        assert_eq!(l.allocate(), Some(pid(2)));
        assert_eq!(l.in_use(), 4);
        assert!(l.reserve(pid(11)).is_err());
    }

    #[test]
    fn clear_frees_everything() {
        let mut l = PidAllocator::new();
        l.allocate().unwrap();
        l.reserve(pid(9)).unwrap();
        l.clear();
        assert_eq!(l.free, btreemap!{1 => u16::MAX});
        assert_eq!(l.in_use(), 0);
    }

    #[test]
    fn never_hands_out_held_ids() {
        let mut l = PidAllocator::with_bounds(1, 8);
        let mut held = std::collections::BTreeSet::new();
        // Deterministic interleaving of allocations and releases.
        for step in 0u32..200 {
            if step % 3 == 2 && !held.is_empty() {
                let victim = *held.iter().nth((step as usize / 3) % held.len()).unwrap();
                held.remove(&victim);
                l.release(victim).unwrap();
            } else if let Some(p) = l.allocate() {
                assert!(held.insert(p), "{} handed out twice", p);
            } else {
                assert_eq!(held.len(), 8);
            }
            assert_eq!(l.in_use(), held.len());
        }
    }

    #[test]
    #[should_panic]
    fn bad_bounds_swapped() {
        PidAllocator::with_bounds(10, 5);
    }

    #[test]
    #[should_panic]
    fn bad_bounds_zero() {
        PidAllocator::with_bounds(0, 5);
    }
}
