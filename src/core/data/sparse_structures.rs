///////////
// Enums //
///////////

/// Storage layout of a compressed sparse matrix
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressedSparseFormat {
    /// Compressed sparse column: `indptr` runs over columns, `indices` are rows
    Csc,
    /// Compressed sparse row: `indptr` runs over rows, `indices` are columns
    Csr,
}

////////////////
// Structures //
////////////////

/// Compressed sparse matrix
///
/// Count matrices are stored genes x cells in CSC, i.e., one compressed
/// column per cell with the gene (row) indices sorted ascending.
///
/// ### Fields
///
/// * `data` - The non-zero values.
/// * `indices` - Inner indices of the values (rows for CSC, columns for CSR).
/// * `indptr` - Outer index pointers (columns for CSC, rows for CSR).
/// * `cs_type` - The storage layout.
/// * `shape` - `(nrow, ncol)` of the represented matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedSparseData<T> {
    pub data: Vec<T>,
    pub indices: Vec<usize>,
    pub indptr: Vec<usize>,
    pub cs_type: CompressedSparseFormat,
    pub shape: (usize, usize),
}

impl<T> CompressedSparseData<T>
where
    T: Copy + Default,
{
    /// Generate a new CSC version of the matrix
    ///
    /// ### Params
    ///
    /// * `data` - The underlying data
    /// * `indices` - The row indices of the data
    /// * `indptr` - The column index pointers
    /// * `shape` - `(nrow, ncol)`
    pub fn new_csc(
        data: Vec<T>,
        indices: Vec<usize>,
        indptr: Vec<usize>,
        shape: (usize, usize),
    ) -> Self {
        debug_assert_eq!(indptr.len(), shape.1 + 1);
        Self {
            data,
            indices,
            indptr,
            cs_type: CompressedSparseFormat::Csc,
            shape,
        }
    }

    /// Return the number of non-zero values
    pub fn get_nnz(&self) -> usize {
        self.data.len()
    }

    /// Return the shape as `(nrow, ncol)`
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Number of compressed (outer) slices
    pub fn outer_dim(&self) -> usize {
        self.indptr.len() - 1
    }

    /// Size of the inner dimension
    pub fn inner_dim(&self) -> usize {
        match self.cs_type {
            CompressedSparseFormat::Csc => self.shape.0,
            CompressedSparseFormat::Csr => self.shape.1,
        }
    }

    /// Get one compressed slice
    ///
    /// ### Params
    ///
    /// * `i` - Outer index (column for CSC, row for CSR)
    ///
    /// ### Returns
    ///
    /// Tuple of `(inner_indices, values)`
    #[inline]
    pub fn outer(&self, i: usize) -> (&[usize], &[T]) {
        let start = self.indptr[i];
        let end = self.indptr[i + 1];
        (&self.indices[start..end], &self.data[start..end])
    }

    /// Map the stored values, keeping the sparsity pattern
    ///
    /// ### Params
    ///
    /// * `f` - Closure receiving the outer index and the value
    pub fn map_values<U, F>(&self, f: F) -> CompressedSparseData<U>
    where
        F: Fn(usize, T) -> U,
    {
        let mut data = Vec::with_capacity(self.data.len());
        for i in 0..self.outer_dim() {
            let (_, values) = self.outer(i);
            data.extend(values.iter().map(|&v| f(i, v)));
        }
        CompressedSparseData {
            data,
            indices: self.indices.clone(),
            indptr: self.indptr.clone(),
            cs_type: self.cs_type,
            shape: self.shape,
        }
    }

    /// Switch between CSC and CSR storage
    ///
    /// ### Returns
    ///
    /// The same matrix stored in the other layout with sorted inner indices.
    pub fn to_other_format(&self) -> Self {
        let new_outer = self.inner_dim();
        let nnz = self.get_nnz();
        let mut new_ptr = vec![0_usize; new_outer + 1];

        for &idx in &self.indices {
            new_ptr[idx + 1] += 1;
        }
        for i in 0..new_outer {
            new_ptr[i + 1] += new_ptr[i];
        }

        let mut new_data = vec![T::default(); nnz];
        let mut new_indices = vec![0_usize; nnz];
        let mut next = new_ptr[..new_outer].to_vec();

        for outer in 0..self.outer_dim() {
            let (inner, values) = self.outer(outer);
            for (&idx, &val) in inner.iter().zip(values.iter()) {
                let pos = next[idx];
                new_data[pos] = val;
                new_indices[pos] = outer;
                next[idx] += 1;
            }
        }

        let cs_type = match self.cs_type {
            CompressedSparseFormat::Csc => CompressedSparseFormat::Csr,
            CompressedSparseFormat::Csr => CompressedSparseFormat::Csc,
        };

        Self {
            data: new_data,
            indices: new_indices,
            indptr: new_ptr,
            cs_type,
            shape: self.shape,
        }
    }

    /// Subset rows and columns
    ///
    /// The result keeps the order given in `rows` and `cols`; inner indices
    /// are remapped into the new positions.
    ///
    /// ### Params
    ///
    /// * `rows` - Row indices to keep
    /// * `cols` - Column indices to keep
    pub fn subset(&self, rows: &[usize], cols: &[usize]) -> Self {
        let (outer_keep, inner_keep) = match self.cs_type {
            CompressedSparseFormat::Csc => (cols, rows),
            CompressedSparseFormat::Csr => (rows, cols),
        };

        let mut inner_map: Vec<Option<usize>> = vec![None; self.inner_dim()];
        for (new_idx, &old_idx) in inner_keep.iter().enumerate() {
            inner_map[old_idx] = Some(new_idx);
        }

        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = Vec::with_capacity(outer_keep.len() + 1);
        indptr.push(0_usize);

        let mut buffer: Vec<(usize, T)> = Vec::new();
        for &outer in outer_keep {
            buffer.clear();
            let (inner, values) = self.outer(outer);
            for (&idx, &val) in inner.iter().zip(values.iter()) {
                if let Some(new_idx) = inner_map[idx] {
                    buffer.push((new_idx, val));
                }
            }
            buffer.sort_unstable_by_key(|(idx, _)| *idx);
            for &(idx, val) in &buffer {
                indices.push(idx);
                data.push(val);
            }
            indptr.push(data.len());
        }

        Self {
            data,
            indices,
            indptr,
            cs_type: self.cs_type,
            shape: (rows.len(), cols.len()),
        }
    }
}

impl<T> CompressedSparseData<T>
where
    T: Copy + Default + Into<f64>,
{
    /// Sum of the stored values per outer slice
    ///
    /// For a genes x cells CSC matrix these are the library sizes.
    pub fn outer_sums(&self) -> Vec<f64> {
        (0..self.outer_dim())
            .map(|i| self.outer(i).1.iter().map(|&v| v.into()).sum())
            .collect()
    }

    /// Densify a single outer slice
    ///
    /// ### Params
    ///
    /// * `i` - Outer index
    ///
    /// ### Returns
    ///
    /// Dense vector with length of the inner dimension
    pub fn outer_dense(&self, i: usize) -> Vec<f64> {
        let mut res = vec![0.0; self.inner_dim()];
        let (inner, values) = self.outer(i);
        for (&idx, &val) in inner.iter().zip(values.iter()) {
            res[idx] = val.into();
        }
        res
    }
}

///////////
// Tests //
///////////
