//! Replica ID set over a fixed-size cluster.

use fixedbitset::FixedBitSet;

/// Set of replica IDs drawn from a cluster of known size: the peers
/// currently alive, the targets of a broadcast, a candidate read quorum.
/// Membership is compact (one bit per replica) and iteration yields member
/// IDs in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSet {
    population: u8,
    bits: FixedBitSet,
}

impl PeerSet {
    /// An empty set over a cluster of `population` replicas.
    pub fn empty(population: u8) -> Self {
        if population == 0 {
            panic!("invalid cluster population 0");
        }
        PeerSet {
            population,
            bits: FixedBitSet::with_capacity(population as usize),
        }
    }

    /// The set of all `population` replica IDs.
    pub fn full(population: u8) -> Self {
        let mut set = Self::empty(population);
        set.bits.set_range(.., true);
        set
    }

    /// A set containing exactly the given replica IDs.
    pub fn of(population: u8, ids: impl IntoIterator<Item = u8>) -> Self {
        let mut set = Self::empty(population);
        for id in ids {
            set.add(id);
        }
        set
    }

    /// Adds a replica ID to the set.
    pub fn add(&mut self, id: u8) {
        if id >= self.population {
            panic!("replica id {} outside population {}", id, self.population);
        }
        self.bits.set(id as usize, true);
    }

    /// Removes a replica ID from the set.
    pub fn remove(&mut self, id: u8) {
        if id >= self.population {
            panic!("replica id {} outside population {}", id, self.population);
        }
        self.bits.set(id as usize, false);
    }

    /// True if the set contains the given replica ID.
    #[inline]
    pub fn contains(&self, id: u8) -> bool {
        (id as usize) < self.bits.len() && self.bits[id as usize]
    }

    /// Size of the cluster this set draws from.
    #[inline]
    pub fn population(&self) -> u8 {
        self.population
    }

    /// Number of replica IDs in the set.
    #[inline]
    pub fn count(&self) -> u8 {
        self.bits.count_ones(..) as u8
    }

    /// True if the members form a strict majority of the cluster, i.e., a
    /// quorum that intersects every other majority.
    pub fn is_majority(&self) -> bool {
        self.count() as u16 > self.population as u16 / 2
    }

    /// Iterates over the member replica IDs in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.bits.ones().map(|id| id as u8)
    }
}

#[cfg(test)]
mod peerset_tests {
    use super::*;

    #[test]
    #[should_panic]
    fn zero_population_panics() {
        PeerSet::empty(0);
    }

    #[test]
    #[should_panic]
    fn out_of_range_add_panics() {
        let mut set = PeerSet::empty(3);
        set.add(3);
    }

    #[test]
    fn membership() {
        let mut set = PeerSet::empty(5);
        set.add(1);
        set.add(4);
        assert!(set.contains(1));
        assert!(!set.contains(2));
        assert!(set.contains(4));
        assert!(!set.contains(5));
        set.remove(1);
        assert!(!set.contains(1));
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn constructors() {
        assert_eq!(PeerSet::full(4).count(), 4);
        assert_eq!(PeerSet::of(4, [0, 3]), PeerSet::of(4, [3, 0]));
        assert_ne!(PeerSet::of(4, [0]), PeerSet::empty(4));
    }

    #[test]
    fn ids_ascending() {
        let set = PeerSet::of(6, [5, 0, 2]);
        assert_eq!(set.ids().collect::<Vec<_>>(), vec![0, 2, 5]);
    }

    #[test]
    fn majority_threshold() {
        assert!(!PeerSet::of(5, [1, 2]).is_majority());
        assert!(PeerSet::of(5, [1, 2, 4]).is_majority());
        assert!(!PeerSet::of(4, [0, 1]).is_majority());
        assert!(PeerSet::of(4, [0, 1, 2]).is_majority());
        assert!(PeerSet::full(2).is_majority());
    }
}
