//! The core data model: transcript-level equivalence classes with per-cell
//! UMI evidence, the transcript-to-gene map and the deduplicated gene-level
//! classes the EM consumes.

use fxhash::FxHashMap;

/// An ordered, duplicate-free set of transcript ids. Keys of the global
/// equivalence-class index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TranscriptGroup(pub Vec<u32>);

impl TranscriptGroup {
    /// Canonicalise a transcript list into a group (sorted, deduplicated).
    pub fn new(mut txps: Vec<u32>) -> Self {
        txps.sort_unstable();
        txps.dedup();
        TranscriptGroup(txps)
    }
}

/// UMI multiset of one cell within one class: 2-bit encoded UMI to read count.
pub type UmiGroup = FxHashMap<u64, u32>;

/// The global equivalence-class index: per class, which cells saw it and
/// with which UMIs.
///
/// Built once before dispatch, then only read (concurrently, by reference)
/// by the workers, and cleared afterwards.
#[derive(Debug, Default)]
pub struct EcIndex {
    classes: FxHashMap<TranscriptGroup, FxHashMap<u32, UmiGroup>>,
}

impl EcIndex {
    /// Empty index.
    pub fn new() -> Self {
        EcIndex::default()
    }

    /// Record `count` reads of `umi` for `cell` under `group`.
    /// Only used during the build phase.
    pub fn add_umi(&mut self, group: TranscriptGroup, cell: u32, umi: u64, count: u32) {
        *self
            .classes
            .entry(group)
            .or_default()
            .entry(cell)
            .or_default()
            .entry(umi)
            .or_insert(0) += count;
    }

    /// Whether `key` already has an entry.
    pub fn contains(&self, key: &TranscriptGroup) -> bool {
        self.classes.contains_key(key)
    }

    /// The per-cell UMI groups of `key`.
    pub fn lookup(&self, key: &TranscriptGroup) -> Option<&FxHashMap<u32, UmiGroup>> {
        self.classes.get(key)
    }

    /// Number of classes in the index.
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// The class keys in the order the workers walk them: single-transcript
    /// classes first, then by transcript ids. The order is deterministic so
    /// repeated runs emit identical per-cell records.
    pub fn ordered_keys(&self) -> Vec<TranscriptGroup> {
        let mut keys: Vec<TranscriptGroup> = self.classes.keys().cloned().collect();
        keys.sort_unstable_by(|a, b| {
            (a.0.len() != 1)
                .cmp(&(b.0.len() != 1))
                .then_with(|| a.cmp(b))
        });
        keys
    }

    /// Drop all classes. Called once after dispatch.
    pub fn clear(&mut self) {
        self.classes.clear();
        self.classes.shrink_to_fit();
    }
}

/// A deduplicated gene-level equivalence class: canonical (sorted, unique,
/// non-empty) gene labels and the number of inferred molecules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneEqClass {
    /// Gene ids, sorted and duplicate-free.
    pub labels: Vec<u32>,
    /// Deduplicated molecule count, at least 1.
    pub count: u32,
}

/// Dense transcript-to-gene mapping.
#[derive(Debug, Clone)]
pub struct Tx2Gene {
    map: Vec<u32>,
    num_genes: u32,
}

impl Tx2Gene {
    /// Wrap a dense `transcript id -> gene id` vector.
    pub fn new(map: Vec<u32>, num_genes: u32) -> Self {
        Tx2Gene { map, num_genes }
    }

    /// Gene id of `tx`, or `None` when the transcript is out of range.
    pub fn gene(&self, tx: u32) -> Option<u32> {
        self.map.get(tx as usize).copied()
    }

    /// Number of transcripts in the map.
    pub fn num_transcripts(&self) -> u32 {
        self.map.len() as u32
    }

    /// Number of genes in the current index.
    pub fn num_genes(&self) -> u32 {
        self.num_genes
    }
}
