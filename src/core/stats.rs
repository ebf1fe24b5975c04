// This module tracks statistics about generated kernels. GenerationStats is filled in as
// kernels are assembled and finalized: it counts kernels per family (gemm, brgemm, the unary
// operations), total instruction words, labels and branch fixups resolved by the assembler,
// and remembers the largest kernel produced. The Display implementation prints a compact
// summary used by the kernel_dump tool and by debug logging of compiled tensor operations.

//! Kernel generation statistics.

use std::collections::HashMap;
use std::fmt;

use super::assembler::AssembledCode;

/// Counters collected while generating kernels.
#[derive(Debug, Default, Clone)]
pub struct GenerationStats {
    /// Number of kernels generated.
    pub kernels_generated: usize,

    /// Total instruction words emitted.
    pub total_words: usize,

    /// Labels created across all kernels.
    pub labels_created: usize,

    /// Branch fixups resolved across all kernels.
    pub fixups_resolved: usize,

    /// Kernels generated per family.
    pub kernel_counts: HashMap<&'static str, usize>,

    /// Largest kernel so far, in words.
    pub largest_kernel_words: usize,

    /// Family of the largest kernel.
    pub largest_kernel_family: &'static str,
}

impl GenerationStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one assembled kernel of the given family.
    pub fn record(&mut self, family: &'static str, code: &AssembledCode) {
        let words = code.buffer.len_words();
        self.kernels_generated += 1;
        self.total_words += words;
        self.labels_created += code.labels;
        self.fixups_resolved += code.fixups;
        *self.kernel_counts.entry(family).or_insert(0) += 1;
        if words > self.largest_kernel_words {
            self.largest_kernel_words = words;
            self.largest_kernel_family = family;
        }
    }

    /// Fold another set of counters into this one.
    pub fn merge(&mut self, other: &GenerationStats) {
        self.kernels_generated += other.kernels_generated;
        self.total_words += other.total_words;
        self.labels_created += other.labels_created;
        self.fixups_resolved += other.fixups_resolved;
        for (family, count) in &other.kernel_counts {
            *self.kernel_counts.entry(*family).or_insert(0) += count;
        }
        if other.largest_kernel_words > self.largest_kernel_words {
            self.largest_kernel_words = other.largest_kernel_words;
            self.largest_kernel_family = other.largest_kernel_family;
        }
    }
}

impl fmt::Display for GenerationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Kernel Generation Statistics:")?;
        writeln!(f, "  Kernels generated: {}", self.kernels_generated)?;
        writeln!(f, "  Total code size: {} words ({} bytes)", self.total_words, self.total_words * 4)?;
        writeln!(f, "  Labels created: {}", self.labels_created)?;
        writeln!(f, "  Fixups resolved: {}", self.fixups_resolved)?;

        if self.largest_kernel_words > 0 {
            writeln!(
                f,
                "  Largest kernel: {} ({} words)",
                self.largest_kernel_family, self.largest_kernel_words
            )?;
        }

        if !self.kernel_counts.is_empty() {
            writeln!(f, "  Kernel breakdown:")?;
            let mut sorted: Vec<_> = self.kernel_counts.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
            for (family, count) in sorted {
                writeln!(f, "    {family}: {count}")?;
            }
        }

        Ok(())
    }
}
