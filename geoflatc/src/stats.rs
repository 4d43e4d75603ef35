use std::fmt;
use std::ops::AddAssign;

/// Elements read from the PBF file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats {
    pub num_blocks: usize,
    pub num_nodes: usize,
    pub num_ways: usize,
    pub num_relations: usize,
    /// Relation members of other types than nodes, ways and relations.
    pub num_unknown_members: usize,
}

impl AddAssign for Stats {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.num_blocks += other.num_blocks;
        self.num_nodes += other.num_nodes;
        self.num_ways += other.num_ways;
        self.num_relations += other.num_relations;
        self.num_unknown_members += other.num_unknown_members;
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(
            f,
            r#"Read:
  blocks:       {}
  nodes:        {}
  ways:         {}
  relations:    {}
Skipped:
  members:      {}"#,
            self.num_blocks,
            self.num_nodes,
            self.num_ways,
            self.num_relations,
            self.num_unknown_members
        )
    }
}
