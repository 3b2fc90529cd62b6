use crate::domain::{Finding, ModelError, NodeId};
use crate::kernel::bitmap::{for_each_set_bit, read_bitmap};
use crate::memory::Reader;

/// Default `MAX_NUMNODES` (`1 << NODES_SHIFT`, x86-64 default shift 6)
const DEFAULT_MAX_NUMNODES: u32 = 64;

/// NUMA nodes of the target and their `pg_data_t` addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTopology {
    nodes: Vec<(NodeId, u64)>,
}

impl NodeTopology {
    #[must_use]
    pub fn single(pgdat: u64) -> Self {
        Self { nodes: vec![(NodeId(0), pgdat)] }
    }

    /// Possible nodes from `node_states[N_POSSIBLE]` and `node_data[]`
    ///
    /// Non-NUMA kernels have neither and expose `contig_page_data` instead.
    ///
    /// # Errors
    /// Returns `NotFound` if neither `node_data` nor `contig_page_data` exists
    pub fn discover(reader: &Reader<'_>, notes: &mut Vec<Finding>) -> Result<Self, ModelError> {
        let Ok(node_data) = reader.symbol("node_data") else {
            let pgdat = reader
                .symbol("contig_page_data")
                .map_err(|_| ModelError::NotFound("node_data or contig_page_data".to_string()))?;
            log::info!("Non-NUMA kernel, single node at {pgdat:#x}");
            return Ok(Self::single(pgdat));
        };

        let max_nodes = match reader.size_of("nodemask_t") {
            #[allow(clippy::cast_possible_truncation)]
            Ok(bytes) => (bytes * 8) as u32,
            Err(_) => {
                let max = reader
                    .constant("MAX_NUMNODES")
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(DEFAULT_MAX_NUMNODES);
                notes.push(Finding::config_default("MAX_NUMNODES", max));
                max
            }
        };

        let candidates: Vec<u32> = match Self::possible_nids(reader, max_nodes) {
            Ok(nids) => nids,
            Err(err) => {
                log::warn!("node_states unusable ({err}), scanning node_data");
                notes.push(Finding::config_default("node_states[N_POSSIBLE]", "non-null node_data entries"));
                (0..max_nodes).collect()
            }
        };

        let ptr = reader.pointer_size();
        let mut nodes = Vec::new();
        for nid in candidates {
            let pgdat = reader.read_ptr(node_data + u64::from(nid) * ptr)?;
            if pgdat != 0 {
                nodes.push((NodeId(nid), pgdat));
            }
        }

        log::info!("Found {} possible NUMA nodes", nodes.len());
        Ok(Self { nodes })
    }

    fn possible_nids(reader: &Reader<'_>, max_nodes: u32) -> Result<Vec<u32>, ModelError> {
        let states = reader.symbol("node_states")?;
        let n_possible = reader.enum_value("enum node_states", "N_POSSIBLE")?;
        let mask_size = reader.size_of("nodemask_t")?;
        let n_possible = u64::try_from(n_possible)
            .map_err(|_| ModelError::unsupported("enum node_states", "negative N_POSSIBLE"))?;

        let words = read_bitmap(reader, states + n_possible * mask_size, max_nodes)?;
        Ok(for_each_set_bit(&words, reader.arch().bits_per_long(), max_nodes).collect())
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().map(|(nid, _)| *nid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, u64)> + '_ {
        self.nodes.iter().copied()
    }

    #[must_use]
    pub fn pgdat(&self, nid: NodeId) -> Option<u64> {
        self.nodes.iter().find(|(n, _)| *n == nid).map(|(_, p)| *p)
    }

    #[must_use]
    pub fn contains(&self, nid: NodeId) -> bool {
        self.pgdat(nid).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// `nr_node_ids`: one past the highest possible node id
    #[must_use]
    pub fn nr_node_ids(&self) -> u32 {
        self.nodes.iter().map(|(nid, _)| nid.0 + 1).max().unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ArchInfo, SparseImage, TypeLayout};

    #[test]
    fn test_numa_nodes_from_node_states() {
        let mut img = SparseImage::new(ArchInfo::x86_64());
        img.map(0x1000, 0x1000);
        img.define_type("nodemask_t", TypeLayout::new(8));
        img.define_type("enum node_states", TypeLayout::new(4).enumerator("N_POSSIBLE", 0));
        img.define_symbol("node_states", 0x1000);
        img.define_symbol("node_data", 0x1100);
        img.write_u64(0x1000, 0b11).unwrap();
        img.write_u64(0x1100, 0xa000).unwrap();
        img.write_u64(0x1108, 0xb000).unwrap();

        let reader = Reader::new(&img);
        let mut notes = Vec::new();
        let topo = NodeTopology::discover(&reader, &mut notes).unwrap();
        assert!(notes.is_empty());
        assert_eq!(topo.len(), 2);
        assert_eq!(topo.pgdat(NodeId(1)), Some(0xb000));
        assert_eq!(topo.nr_node_ids(), 2);
    }

    #[test]
    fn test_contig_page_data() {
        let mut img = SparseImage::new(ArchInfo::x86_64());
        img.define_symbol("contig_page_data", 0xc000);
        let reader = Reader::new(&img);
        let topo = NodeTopology::discover(&reader, &mut Vec::new()).unwrap();
        assert_eq!(topo, NodeTopology::single(0xc000));
    }

    #[test]
    fn test_no_node_symbols() {
        let img = SparseImage::new(ArchInfo::x86_64());
        let reader = Reader::new(&img);
        assert!(matches!(NodeTopology::discover(&reader, &mut Vec::new()), Err(ModelError::NotFound(_))));
    }
}
