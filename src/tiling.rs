//! Tiling plans for the mesh
//!
//! A matrix-vector product `C = A @ B` with `A` of shape MxK is cut into
//! `m`x`k` blocks. Output rows are dealt out to columns of the mesh, then to
//! the compute tiles of each column:
//! - each column owns one contiguous slice of output rows
//! - each core walks `row_blocks_per_core` row blocks of `m` rows
//! - each row block accumulates over `K / k` reduction blocks
//!
//! A stream pass-through cuts a flat vector into one equal slice per column.

use std::ops::Range;

use serde::Serialize;

use crate::error::{CompileError, CompileResult};
use crate::hardware::ElementType;

/// User-supplied problem dimensions for a matrix-vector product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProblemDims {
    /// Rows of A (M)
    pub rows: usize,
    /// Columns of A, length of B (K)
    pub cols: usize,
    /// Row block size (m)
    pub block_rows: usize,
    /// Reduction block size (k)
    pub block_cols: usize,
    /// Total compute tiles used
    pub n_cores: usize,
    /// Mesh columns used
    pub n_cols: usize,
}

impl ProblemDims {
    pub fn new(
        rows: usize,
        cols: usize,
        block_rows: usize,
        block_cols: usize,
        n_cores: usize,
        n_cols: usize,
    ) -> Self {
        Self {
            rows,
            cols,
            block_rows,
            block_cols,
            n_cores,
            n_cols,
        }
    }
}

/// Derived quantities, computed with the plain integer formulas before any
/// divisibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Derivation {
    pub cores_per_column: usize,
    pub row_blocks_per_core: usize,
    pub reduction_blocks: usize,
}

/// A validated tiling of a matrix-vector product
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TilingPlan {
    pub dims: ProblemDims,
    pub cores_per_column: usize,
    pub row_blocks_per_core: usize,
    pub reduction_blocks: usize,
    /// Output rows owned by each mesh column, ordered by column index
    pub columns: Vec<ColumnSlice>,
}

/// Output rows assigned to one mesh column
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSlice {
    pub column: usize,
    pub rows: Range<usize>,
    /// Number of `m`-row blocks in `rows`
    pub row_blocks: usize,
}

/// Derives and validates a [`TilingPlan`]
pub struct TilingPlanner {
    dims: ProblemDims,
}

impl TilingPlanner {
    pub fn new(dims: ProblemDims) -> Self {
        Self { dims }
    }

    /// Derived quantities with floor division; never fails on divisibility.
    pub fn derive(&self) -> CompileResult<Derivation> {
        let d = &self.dims;
        if d.block_rows == 0 || d.block_cols == 0 || d.n_cores == 0 || d.n_cols == 0 {
            return Err(CompileError::tiling(format!(
                "block sizes and core/column counts must be non-zero: {:?}",
                d
            )));
        }
        let rows_per_sweep = d.block_rows.checked_mul(d.n_cores).ok_or_else(|| {
            CompileError::tiling(format!(
                "m = {} over {} cores overflows the row count",
                d.block_rows, d.n_cores
            ))
        })?;
        Ok(Derivation {
            cores_per_column: d.n_cores / d.n_cols,
            row_blocks_per_core: d.rows / rows_per_sweep,
            reduction_blocks: d.cols / d.block_cols,
        })
    }

    /// Validate the dimensions and build the plan.
    pub fn plan(&self) -> CompileResult<TilingPlan> {
        let d = self.dims;
        let derived = self.derive()?;

        if d.n_cores % d.n_cols != 0 {
            return Err(CompileError::tiling(format!(
                "{} cores cannot be split evenly across {} columns",
                d.n_cores, d.n_cols
            )));
        }
        if derived.row_blocks_per_core == 0 {
            return Err(CompileError::DegenerateTiling {
                cores_per_column: derived.cores_per_column,
                row_blocks_per_core: derived.row_blocks_per_core,
                reduction_blocks: derived.reduction_blocks,
            });
        }
        if d.rows % d.block_rows != 0 {
            return Err(CompileError::tiling(format!(
                "M = {} is not a multiple of m = {}",
                d.rows, d.block_rows
            )));
        }
        if d.cols % d.block_cols != 0 {
            return Err(CompileError::tiling(format!(
                "K = {} is not a multiple of k = {}",
                d.cols, d.block_cols
            )));
        }
        if (d.rows / d.block_rows) % d.n_cores != 0 {
            return Err(CompileError::tiling(format!(
                "{} row blocks cannot be split evenly across {} cores",
                d.rows / d.block_rows,
                d.n_cores
            )));
        }

        let row_blocks = derived.cores_per_column * derived.row_blocks_per_core;
        let rows_per_column = row_blocks * d.block_rows;
        let columns = (0..d.n_cols)
            .map(|column| ColumnSlice {
                column,
                rows: column * rows_per_column..(column + 1) * rows_per_column,
                row_blocks,
            })
            .collect();

        tracing::debug!(
            cores_per_column = derived.cores_per_column,
            row_blocks_per_core = derived.row_blocks_per_core,
            reduction_blocks = derived.reduction_blocks,
            "matvec tiling planned"
        );

        Ok(TilingPlan {
            dims: d,
            cores_per_column: derived.cores_per_column,
            row_blocks_per_core: derived.row_blocks_per_core,
            reduction_blocks: derived.reduction_blocks,
            columns,
        })
    }
}

impl TilingPlan {
    pub fn rows_per_column(&self) -> usize {
        self.cores_per_column * self.row_blocks_per_core * self.dims.block_rows
    }

    /// Output rows computed by one core, in the order it produces them.
    ///
    /// The column's rows arrive in groups of `cores_per_column * m` rows; core
    /// `core` takes the `core`-th run of `m` rows from every group.
    pub fn core_rows(&self, column: usize, core: usize) -> Vec<Range<usize>> {
        let m = self.dims.block_rows;
        let group = self.cores_per_column * m;
        let Some(slice) = self.columns.get(column) else {
            return Vec::new();
        };
        (0..self.row_blocks_per_core)
            .map(|g| {
                let start = slice.rows.start + g * group + core * m;
                start..start + m
            })
            .collect()
    }
}

/// Dimensions of a stream pass-through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamDims {
    /// Total vector length in elements
    pub length: usize,
    pub element: ElementType,
    pub n_cols: usize,
    /// 1 for a two-tier design, more for a distribute/join design
    pub cores_per_column: usize,
    /// Elements per compute channel slot
    pub line_len: usize,
}

/// A validated split of a stream across columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamPlan {
    pub dims: StreamDims,
    pub per_column: usize,
    /// Slots each compute tile processes per invocation
    pub lines_per_core: usize,
    /// Element range owned by each column
    pub columns: Vec<Range<usize>>,
}

/// Validates a [`StreamDims`] into a [`StreamPlan`]
pub struct StreamPlanner {
    dims: StreamDims,
}

impl StreamPlanner {
    pub fn new(dims: StreamDims) -> Self {
        Self { dims }
    }

    pub fn plan(&self) -> CompileResult<StreamPlan> {
        let d = self.dims;
        if d.n_cols == 0 || d.cores_per_column == 0 || d.line_len == 0 {
            return Err(CompileError::tiling(format!(
                "column count, cores per column and line length must be non-zero: {:?}",
                d
            )));
        }
        if d.length == 0 || d.length % d.n_cols != 0 {
            return Err(CompileError::tiling(format!(
                "vector of {} elements cannot be split evenly across {} columns",
                d.length, d.n_cols
            )));
        }
        let per_column = d.length / d.n_cols;
        let chunk = d.line_len.checked_mul(d.cores_per_column).ok_or_else(|| {
            CompileError::tiling(format!(
                "{} lines of {} elements overflow the column slice",
                d.cores_per_column, d.line_len
            ))
        })?;
        if per_column % chunk != 0 {
            return Err(CompileError::tiling(format!(
                "column slice of {} elements is not a multiple of {} lines of {}",
                per_column, d.cores_per_column, d.line_len
            )));
        }
        d.element.to_words(per_column)?;

        let columns = (0..d.n_cols)
            .map(|c| c * per_column..(c + 1) * per_column)
            .collect();
        Ok(StreamPlan {
            dims: d,
            per_column,
            lines_per_core: per_column / chunk,
            columns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_parameters_are_degenerate() {
        let planner = TilingPlanner::new(ProblemDims::new(288, 288, 64, 64, 8, 4));
        let derived = planner.derive().unwrap();
        assert_eq!(derived.cores_per_column, 2);
        assert_eq!(derived.reduction_blocks, 4);
        assert_eq!(derived.row_blocks_per_core, 0);
        assert_eq!(
            planner.plan(),
            Err(CompileError::DegenerateTiling {
                cores_per_column: 2,
                row_blocks_per_core: 0,
                reduction_blocks: 4,
            })
        );
    }

    #[test]
    fn test_column_slices_partition_rows() {
        let plan = TilingPlanner::new(ProblemDims::new(1024, 512, 64, 64, 8, 4))
            .plan()
            .unwrap();
        assert_eq!(plan.cores_per_column, 2);
        assert_eq!(plan.row_blocks_per_core, 2);
        assert_eq!(plan.reduction_blocks, 8);
        let ranges: Vec<_> = plan.columns.iter().map(|c| c.rows.clone()).collect();
        assert_eq!(ranges, vec![0..256, 256..512, 512..768, 768..1024]);
        let blocks: usize = plan.columns.iter().map(|c| c.row_blocks).sum();
        assert_eq!(blocks, 1024 / 64);
    }

    #[test]
    fn test_core_rows_interleave_within_column() {
        let plan = TilingPlanner::new(ProblemDims::new(32, 16, 4, 8, 4, 2))
            .plan()
            .unwrap();
        assert_eq!(plan.core_rows(1, 0), vec![16..20, 24..28]);
        assert_eq!(plan.core_rows(1, 1), vec![20..24, 28..32]);
    }

    #[test]
    fn test_indivisible_dimensions() {
        let uneven_k = TilingPlanner::new(ProblemDims::new(512, 100, 64, 64, 8, 4)).plan();
        assert!(matches!(uneven_k, Err(CompileError::TilingError { .. })));

        let uneven_cores = TilingPlanner::new(ProblemDims::new(512, 128, 64, 64, 6, 4)).plan();
        assert!(matches!(uneven_cores, Err(CompileError::TilingError { .. })));

        // 9 row blocks over 8 cores: at least one block each, but not even
        let uneven_blocks = TilingPlanner::new(ProblemDims::new(576, 128, 64, 64, 8, 4)).plan();
        assert!(matches!(uneven_blocks, Err(CompileError::TilingError { .. })));
    }

    #[test]
    fn test_oversized_dimensions_are_tiling_errors() {
        let huge = TilingPlanner::new(ProblemDims::new(64, 64, usize::MAX / 2, 16, 4, 2));
        assert!(matches!(huge.derive(), Err(CompileError::TilingError { .. })));

        let wide_lines = StreamPlanner::new(StreamDims {
            length: 512,
            element: ElementType::U8,
            n_cols: 4,
            cores_per_column: 4,
            line_len: usize::MAX / 2,
        })
        .plan();
        assert!(matches!(wide_lines, Err(CompileError::TilingError { .. })));

        assert!(ElementType::F32.to_words(usize::MAX / 2).unwrap_err().is_tiling());
    }

    #[test]
    fn test_stream_plan() {
        let plan = StreamPlanner::new(StreamDims {
            length: 512,
            element: ElementType::U8,
            n_cols: 4,
            cores_per_column: 2,
            line_len: 16,
        })
        .plan()
        .unwrap();
        assert_eq!(plan.per_column, 128);
        assert_eq!(plan.lines_per_core, 4);
        assert_eq!(plan.columns[3], 384..512);
    }

    #[test]
    fn test_stream_plan_rejects_partial_lines() {
        let result = StreamPlanner::new(StreamDims {
            length: 512,
            element: ElementType::U8,
            n_cols: 4,
            cores_per_column: 1,
            line_len: 48,
        })
        .plan();
        assert!(result.unwrap_err().is_tiling());
    }
}
