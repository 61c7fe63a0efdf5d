//! Error types for the tile mesh mapper

use thiserror::Error;

/// Result type for mapping operations
pub type CompileResult<T> = Result<T, CompileError>;

/// Mapping errors.
///
/// All of these are raised while the graph is being constructed. None of them
/// are retryable: a failing design has to be fixed by the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("Tiling error: {message}")]
    TilingError { message: String },

    #[error(
        "Degenerate tiling: {row_blocks_per_core} row blocks per core \
         ({cores_per_column} cores per column, {reduction_blocks} reduction blocks) \
         would produce empty transfers"
    )]
    DegenerateTiling {
        cores_per_column: usize,
        row_blocks_per_core: usize,
        reduction_blocks: usize,
    },

    #[error("Topology error: {message}")]
    TopologyError { message: String },

    #[error("Descriptor error: {message}")]
    DescriptorError { message: String },

    #[error("Kernel signature mismatch for {kernel}: {message}")]
    KernelSignature { kernel: String, message: String },

    #[error("Runtime error: {message}")]
    RuntimeError { message: String },
}

impl CompileError {
    pub fn tiling(msg: impl Into<String>) -> Self {
        CompileError::TilingError { message: msg.into() }
    }

    pub fn topology(msg: impl Into<String>) -> Self {
        CompileError::TopologyError { message: msg.into() }
    }

    pub fn descriptor(msg: impl Into<String>) -> Self {
        CompileError::DescriptorError { message: msg.into() }
    }

    pub fn signature(kernel: impl Into<String>, msg: impl Into<String>) -> Self {
        CompileError::KernelSignature {
            kernel: kernel.into(),
            message: msg.into(),
        }
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        CompileError::RuntimeError { message: msg.into() }
    }

    /// Whether this error comes from the tiling stage.
    pub fn is_tiling(&self) -> bool {
        matches!(
            self,
            CompileError::TilingError { .. } | CompileError::DegenerateTiling { .. }
        )
    }
}
