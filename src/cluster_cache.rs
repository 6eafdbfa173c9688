use log::trace;
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Slot {
    /// Buffer starting at this VCN, a whole number of clusters long.
    Owner(Vec<u8>),
    /// Covered by the buffer owned by this VCN.
    Alias(u64),
}

/// Clusters of one attribute already fetched from the device, keyed by VCN.
///
/// Every cached VCN resolves to exactly one owning buffer, either directly or
/// through a single back-reference, and owning buffers never overlap.
#[derive(Debug, Clone)]
pub struct ClusterCache {
    cluster_size: usize,
    slots: HashMap<u64, Slot>,
}

impl ClusterCache {
    pub fn new(cluster_size: usize) -> Self {
        Self {
            cluster_size,
            slots: HashMap::new(),
        }
    }

    pub fn contains(&self, vcn: u64) -> bool {
        self.slots.contains_key(&vcn)
    }

    /// Number of owning buffers.
    pub fn buffers(&self) -> usize {
        self.slots
            .values()
            .filter(|s| matches!(s, Slot::Owner(_)))
            .count()
    }

    // (owner vcn, buffer, clusters in buffer)
    fn owner(&self, vcn: u64) -> Option<(u64, &Vec<u8>, u64)> {
        let start = match self.slots.get(&vcn)? {
            Slot::Owner(_) => vcn,
            Slot::Alias(owner) => *owner,
        };
        match self.slots.get(&start)? {
            Slot::Owner(data) => Some((start, data, (data.len() / self.cluster_size) as u64)),
            Slot::Alias(_) => None,
        }
    }

    /// Bytes of `count` clusters starting at `vcn`, if all of them are cached.
    pub fn get(&self, vcn: u64, count: u64) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(count as usize * self.cluster_size);
        let mut vcn = vcn;
        let mut left = count;
        while left > 0 {
            let (start, data, len) = self.owner(vcn)?;
            let offset = vcn - start;
            let take = left.min(len - offset);
            let from = offset as usize * self.cluster_size;
            out.extend_from_slice(&data[from..from + take as usize * self.cluster_size]);
            vcn += take;
            left -= take;
        }
        Some(out)
    }

    /// Cache `data` as the clusters starting at `start_vcn`, truncating or
    /// splitting any buffer it partially overlaps.
    pub fn put(&mut self, start_vcn: u64, mut data: Vec<u8>) {
        let clusters = (data.len() / self.cluster_size) as u64;
        if clusters == 0 {
            return;
        }
        data.truncate(clusters as usize * self.cluster_size);
        let end_vcn = start_vcn + clusters - 1;

        let head = self.owner(start_vcn).map(|(s, _, len)| (s, len));
        let tail = self.owner(end_vcn).map(|(s, _, len)| (s, len));

        // Already inside one buffer.
        if let (Some((hs, _)), Some((ts, _))) = (head, tail) {
            if hs == ts {
                return;
            }
        }

        if let Some((owner, _)) = head {
            if owner != start_vcn {
                let keep = (start_vcn - owner) as usize * self.cluster_size;
                if let Some(Slot::Owner(buf)) = self.slots.get_mut(&owner) {
                    buf.truncate(keep);
                }
                trace!("cluster cache: truncated buffer at VCN {} to {} bytes", owner, keep);
            }
        }

        if let Some((owner, len)) = tail {
            let owner_end = owner + len - 1;
            if owner_end != end_vcn {
                let leftover_vcn = end_vcn + 1;
                let from = (leftover_vcn - owner) as usize * self.cluster_size;
                let leftover = match self.slots.get(&owner) {
                    Some(Slot::Owner(buf)) => buf[from..].to_vec(),
                    _ => Vec::new(),
                };
                self.slots.insert(leftover_vcn, Slot::Owner(leftover));
                for vcn in leftover_vcn + 1..=owner_end {
                    self.slots.insert(vcn, Slot::Alias(leftover_vcn));
                }
                trace!(
                    "cluster cache: split tail VCN {}..={} off buffer at {}",
                    leftover_vcn, owner_end, owner
                );
            }
        }

        self.slots.insert(start_vcn, Slot::Owner(data));
        for vcn in start_vcn + 1..=end_vcn {
            self.slots.insert(vcn, Slot::Alias(start_vcn));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CS: usize = 4;

    fn clusters(vcns: std::ops::RangeInclusive<u64>, tag: u8) -> Vec<u8> {
        vcns.flat_map(|v| vec![tag.wrapping_add(v as u8); CS]).collect()
    }

    #[test]
    fn get_spans_several_buffers() {
        let mut cache = ClusterCache::new(CS);
        cache.put(0, clusters(0..=1, 0));
        cache.put(2, clusters(2..=4, 0));
        assert_eq!(cache.buffers(), 2);
        assert_eq!(cache.get(1, 3), Some(clusters(1..=3, 0)));
        assert_eq!(cache.get(4, 2), None);
    }

    #[test]
    fn overlapping_put_truncates_and_splits() {
        let mut cache = ClusterCache::new(CS);
        cache.put(0, clusters(0..=3, 0)); // A: 0..=3
        cache.put(6, clusters(6..=9, 0)); // B: 6..=9
        cache.put(2, clusters(2..=7, 100)); // overlaps A tail and B head

        assert_eq!(cache.get(0, 2), Some(clusters(0..=1, 0)));
        assert_eq!(cache.get(2, 6), Some(clusters(2..=7, 100)));
        assert_eq!(cache.get(8, 2), Some(clusters(8..=9, 0)));
        assert_eq!(cache.buffers(), 3);

        // every VCN belongs to exactly one owner and owners are disjoint
        let mut covered = Vec::new();
        for (vcn, slot) in &cache.slots {
            if let Slot::Owner(buf) = slot {
                let n = (buf.len() / CS) as u64;
                covered.extend(*vcn..*vcn + n);
            }
        }
        covered.sort();
        assert_eq!(covered, (0..=9).collect::<Vec<_>>());
    }

    #[test]
    fn sub_range_of_one_buffer_is_a_no_op() {
        let mut cache = ClusterCache::new(CS);
        cache.put(0, clusters(0..=5, 0));
        cache.put(2, clusters(2..=3, 50));
        assert_eq!(cache.buffers(), 1);
        assert_eq!(cache.get(2, 2), Some(clusters(2..=3, 0)));
    }

    #[test]
    fn covering_put_replaces_inner_buffers() {
        let mut cache = ClusterCache::new(CS);
        cache.put(3, clusters(3..=4, 0));
        cache.put(0, clusters(0..=7, 9));
        assert_eq!(cache.buffers(), 1);
        assert_eq!(cache.get(0, 8), Some(clusters(0..=7, 9)));
    }
}
