//! Tile Mesh Mapper
//!
//! This library maps a tiled matrix-vector product (and a simple stream
//! pass-through) onto a mesh of interface, stage and compute tiles. It
//! produces the channel network, the per-core compute loops and the host
//! transfer descriptors with their completion barriers, and can execute
//! the result on a thread-per-tile simulator.
//!
//! # Example
//!
//! ```rust
//! use tile_mesh_mapper::{compile_matvec, MatVecDesign, MeshConfig, ProblemDims};
//!
//! let dims = ProblemDims::new(512, 256, 32, 64, 8, 4);
//! let program = compile_matvec(&MatVecDesign::new(dims), &MeshConfig::npu_4col()).unwrap();
//! assert_eq!(program.tasks.len(), 8);
//! println!("{}", program);
//! ```

pub mod error;
pub mod hardware;
pub mod tiling;
pub mod topology;
pub mod channel;
pub mod descriptor;
pub mod compute;
pub mod sync;
pub mod codegen;
pub mod kernels;
pub mod runtime;

pub use channel::{AccessPattern, ChannelNetwork, Link};
pub use codegen::{CodeGenerator, MatVecDesign, MeshProgram};
pub use compute::KernelVariant;
pub use descriptor::{Direction, TransferDescriptor};
pub use error::{CompileError, CompileResult};
pub use hardware::{ElementType, MeshConfig, TileCoord};
pub use kernels::{Kernel, KernelRegistry};
pub use runtime::{execute, Execution, Invocation, MeshRuntime, Session};
pub use sync::{Barrier, HostOp};
pub use tiling::{ProblemDims, StreamDims, TilingPlanner};

/// Map a matrix-vector design onto the mesh
pub fn compile_matvec(design: &MatVecDesign, config: &MeshConfig) -> CompileResult<MeshProgram> {
    config.validate()?;
    CodeGenerator::new(config.clone()).generate_matvec(design)
}

/// Map a stream pass-through onto the mesh
pub fn compile_stream(dims: &StreamDims, config: &MeshConfig) -> CompileResult<MeshProgram> {
    config.validate()?;
    CodeGenerator::new(config.clone()).generate_stream(dims)
}
