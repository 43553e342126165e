use rand::prelude::*;
use rand_distr::{Distribution, Poisson};

use crate::core::data::sparse_structures::CompressedSparseData;
use crate::error::{Result, ScError};
use crate::ensure_config;

////////////////
// Structures //
////////////////

/// Design of a block structured synthetic count matrix
///
/// Genes and cells are split into `n_blocks` contiguous blocks. Cells of
/// block `b` express the genes of block `b` at `base_rate * fold_change`,
/// every other gene at `base_rate` (Poisson counts).
///
/// ### Fields
///
/// * `n_genes` - Number of genes.
/// * `n_cells` - Number of cells.
/// * `n_blocks` - Number of gene/cell blocks.
/// * `base_rate` - Poisson rate of the background expression.
/// * `fold_change` - Multiplier for the block specific genes.
/// * `seed` - Seed for reproducibility purposes.
#[derive(Clone, Debug)]
pub struct BlockDesign {
    pub n_genes: usize,
    pub n_cells: usize,
    pub n_blocks: usize,
    pub base_rate: f64,
    pub fold_change: f64,
    pub seed: u64,
}

impl Default for BlockDesign {
    fn default() -> Self {
        Self {
            n_genes: 100,
            n_cells: 50,
            n_blocks: 2,
            base_rate: 2.0,
            fold_change: 4.0,
            seed: 42,
        }
    }
}

/// Synthetic counts with their ground truth
///
/// ### Fields
///
/// * `counts` - Genes x cells CSC counts.
/// * `gene_ids` - `GENE1`, `GENE2`, ...
/// * `cell_ids` - `CELL1`, `CELL2`, ...
/// * `gene_blocks` - Block of each gene.
/// * `cell_blocks` - Block of each cell.
#[derive(Clone, Debug)]
pub struct SyntheticCounts {
    pub counts: CompressedSparseData<u32>,
    pub gene_ids: Vec<String>,
    pub cell_ids: Vec<String>,
    pub gene_blocks: Vec<usize>,
    pub cell_blocks: Vec<usize>,
}

///////////////
// Functions //
///////////////

/// Generate block structured Poisson counts
///
/// ### Params
///
/// * `design` - The `BlockDesign`
///
/// ### Returns
///
/// The `SyntheticCounts`
pub fn generate_block_counts(design: &BlockDesign) -> Result<SyntheticCounts> {
    ensure_config!(
        design.n_blocks > 0 && design.n_blocks <= design.n_genes.min(design.n_cells),
        "n_blocks must be between 1 and min(n_genes, n_cells)"
    );
    ensure_config!(
        design.base_rate > 0.0 && design.fold_change > 0.0,
        "base_rate and fold_change must be positive"
    );

    let gene_blocks: Vec<usize> = (0..design.n_genes)
        .map(|g| g * design.n_blocks / design.n_genes)
        .collect();
    let cell_blocks: Vec<usize> = (0..design.n_cells)
        .map(|c| c * design.n_blocks / design.n_cells)
        .collect();

    let background = Poisson::new(design.base_rate)
        .map_err(|e| ScError::Configuration(format!("invalid Poisson rate: {}", e)))?;
    let up = Poisson::new(design.base_rate * design.fold_change)
        .map_err(|e| ScError::Configuration(format!("invalid Poisson rate: {}", e)))?;

    let mut data = Vec::with_capacity(design.n_genes * design.n_cells);
    let mut indices = Vec::with_capacity(design.n_genes * design.n_cells);
    let mut indptr = Vec::with_capacity(design.n_cells + 1);
    indptr.push(0);

    for (cell_idx, &cell_block) in cell_blocks.iter().enumerate() {
        let mut rng = StdRng::seed_from_u64(design.seed + cell_idx as u64);
        for (gene_idx, &gene_block) in gene_blocks.iter().enumerate() {
            let count = if gene_block == cell_block {
                up.sample(&mut rng)
            } else {
                background.sample(&mut rng)
            } as u32;
            if count > 0 {
                indices.push(gene_idx);
                data.push(count);
            }
        }
        indptr.push(indices.len());
    }

    Ok(SyntheticCounts {
        counts: CompressedSparseData::new_csc(
            data,
            indices,
            indptr,
            (design.n_genes, design.n_cells),
        ),
        gene_ids: (1..=design.n_genes).map(|i| format!("GENE{}", i)).collect(),
        cell_ids: (1..=design.n_cells).map(|i| format!("CELL{}", i)).collect(),
        gene_blocks,
        cell_blocks,
    })
}

///////////
// Tests //
///////////
