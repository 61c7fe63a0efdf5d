//! Program generator
//!
//! Runs the full mapping pipeline for a design: tiling plan, topology,
//! channel network, compute loops, transfer descriptors and barriers. The
//! result is a frozen [`MeshProgram`] for a lowering backend.

use std::fmt;

use serde::Serialize;

use crate::channel::{
    AccessPattern, ChannelHandle, ChannelId, ChannelNetwork, ChannelSpec, NetworkBuilder,
};
use crate::compute::{ComputeLoopGenerator, ComputeTask, KernelDecl, KernelVariant};
use crate::descriptor::{DescriptorGenerator, Direction, HostBuffer, HostBufferId};
use crate::error::{CompileError, CompileResult};
use crate::hardware::{BufferShape, ElementType, MeshConfig, Tier, TileCoord};
use crate::sync::{HostSequence, SyncBarrier};
use crate::tiling::{ProblemDims, StreamDims, StreamPlan, StreamPlanner, TilingPlan, TilingPlanner};
use crate::topology::TopologyModel;

/// A matrix-vector product `C = A @ B` spread over the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MatVecDesign {
    pub dims: ProblemDims,
    /// Element type of A and B
    pub input: ElementType,
    /// Element type of C
    pub output: ElementType,
    pub variant: KernelVariant,
    /// Interface column that broadcasts B; defaults to `1 % n_cols`
    pub broadcast_column: Option<usize>,
}

impl MatVecDesign {
    pub fn new(dims: ProblemDims) -> Self {
        Self {
            dims,
            input: ElementType::Bf16,
            output: ElementType::F32,
            variant: KernelVariant::Vectorized,
            broadcast_column: None,
        }
    }

    pub fn with_variant(mut self, variant: KernelVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_broadcast_column(mut self, column: usize) -> Self {
        self.broadcast_column = Some(column);
        self
    }

    fn broadcast_column(&self) -> usize {
        self.broadcast_column.unwrap_or(1 % self.dims.n_cols.max(1))
    }
}

/// The plan a program was built from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DesignPlan {
    MatVec(TilingPlan),
    Stream(StreamPlan),
}

/// A complete mapped design
#[derive(Debug, Clone, Serialize)]
pub struct MeshProgram {
    pub config: MeshConfig,
    pub plan: DesignPlan,
    pub topology: TopologyModel,
    pub network: ChannelNetwork,
    pub kernels: Vec<KernelDecl>,
    pub tasks: Vec<ComputeTask>,
    pub buffers: Vec<HostBuffer>,
    pub sequence: HostSequence,
    pub summary: String,
}

impl MeshProgram {
    pub fn buffer(&self, name: &str) -> Option<&HostBuffer> {
        self.buffers.iter().find(|b| b.name == name)
    }

    pub fn input_buffers(&self) -> impl Iterator<Item = &HostBuffer> {
        self.buffers
            .iter()
            .filter(|b| b.direction == Direction::HostToDevice)
    }

    /// Generate a summary of the program
    pub fn generate_summary(&mut self) {
        let design = match &self.plan {
            DesignPlan::MatVec(p) => format!(
                "matvec M={} K={} m={} k={} \
                 ({} cores/column, {} row blocks/core, {} reduction blocks)",
                p.dims.rows,
                p.dims.cols,
                p.dims.block_rows,
                p.dims.block_cols,
                p.cores_per_column,
                p.row_blocks_per_core,
                p.reduction_blocks
            ),
            DesignPlan::Stream(p) => format!(
                "stream of {} {} ({} cores/column, {} lines of {}/core)",
                p.dims.length,
                p.dims.element,
                p.dims.cores_per_column,
                p.lines_per_core,
                p.dims.line_len
            ),
        };
        self.summary = format!(
            "Mesh Program Summary:\n\
             =====================\n\
             Design: {}\n\
             Columns: {} of {}\n\
             Compute tiles: {}\n\
             Channels: {} ({} stage links)\n\
             Descriptors: {}\n\
             Barriers: {}\n",
            design,
            self.topology.columns.len(),
            self.config.columns,
            self.tasks.len(),
            self.network.channels().len(),
            self.network.links().len(),
            self.sequence.descriptors.len(),
            self.sequence.barriers.len(),
        );
    }

    /// Export to JSON for a lowering backend
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for MeshProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.summary)?;
        writeln!(f, "Channels:")?;
        for ch in self.network.channels() {
            write!(
                f,
                "  {:<12} {} depth {} slot {}",
                ch.name, ch.id, ch.depth, ch.shape
            )?;
            if let Some(p) = &ch.access_pattern {
                write!(f, " pattern {:?}", p.levels)?;
            }
            writeln!(f)?;
        }
        writeln!(f, "Descriptors:")?;
        for d in &self.sequence.descriptors {
            writeln!(
                f,
                "  {:<12} slot {:>2} offset {:>7} sizes {:?} strides {:?}",
                d.channel_name,
                d.slot,
                d.base(),
                d.sizes,
                d.strides
            )?;
        }
        writeln!(f, "Barriers:")?;
        for b in &self.sequence.barriers {
            writeln!(f, "  {} {:?}", b.group.interface, b.group.direction)?;
        }
        Ok(())
    }
}

/// Generator for mesh programs
pub struct CodeGenerator {
    config: MeshConfig,
}

impl CodeGenerator {
    pub fn new(config: MeshConfig) -> Self {
        Self { config }
    }

    /// Map a matrix-vector product onto the three-tier mesh.
    pub fn generate_matvec(&self, design: &MatVecDesign) -> CompileResult<MeshProgram> {
        let plan = TilingPlanner::new(design.dims).plan()?;
        let dims = plan.dims;
        let (m, k) = (dims.block_rows, dims.block_cols);
        let cpc = plan.cores_per_column;
        let topology = TopologyModel::build(&self.config, dims.n_cols, cpc, true)?;

        let broadcast_column = design.broadcast_column();
        if broadcast_column >= dims.n_cols {
            return Err(CompileError::topology(format!(
                "broadcast column {} is outside the {} design columns",
                broadcast_column, dims.n_cols
            )));
        }

        let buffers = vec![
            HostBuffer {
                id: HostBufferId(0),
                name: "A".to_string(),
                element: design.input,
                words: design.input.to_words(dims.rows * dims.cols)?,
                direction: Direction::HostToDevice,
            },
            HostBuffer {
                id: HostBufferId(1),
                name: "B".to_string(),
                element: design.input,
                words: design.input.to_words(dims.cols)?,
                direction: Direction::HostToDevice,
            },
            HostBuffer {
                id: HostBufferId(2),
                name: "C".to_string(),
                element: design.output,
                words: design.output.to_words(dims.rows)?,
                direction: Direction::DeviceToHost,
            },
        ];

        let mut builder = NetworkBuilder::new(&topology);
        let pattern = AccessPattern::pair_transpose(m, k)?;

        let mut mem_a = Vec::with_capacity(dims.n_cols);
        let mut in_a: Vec<Vec<ChannelHandle>> = Vec::with_capacity(dims.n_cols);
        for col in &topology.columns {
            let stage = stage_coord(col.column, &topology)?;
            let source = builder.channel(ChannelSpec::new(
                ChannelId::new(Tier::Interface, Tier::Stage, col.column, 0),
                format!("memA{}", col.column),
                col.interface.coord,
                vec![stage],
                BufferShape::vector(m * k * cpc, design.input),
            ))?;
            let targets = col
                .compute
                .iter()
                .enumerate()
                .map(|(j, core)| {
                    builder.channel(
                        ChannelSpec::new(
                            ChannelId::new(Tier::Stage, Tier::Compute, col.column, j),
                            format!("inA{}_{}", col.column, core.coord.row),
                            stage,
                            vec![core.coord],
                            BufferShape::matrix(m, k, design.input),
                        )
                        .with_pattern(pattern.clone()),
                    )
                })
                .collect::<CompileResult<Vec<_>>>()?;
            builder.distribute(col.column, source, targets.clone())?;
            mem_a.push(source);
            in_a.push(targets);
        }

        let broadcaster = topology.column(broadcast_column)?.interface.coord;
        let in_b = builder.broadcast(
            ChannelSpec::new(
                ChannelId::new(Tier::Interface, Tier::Compute, broadcast_column, 0),
                "inB",
                broadcaster,
                topology.compute_tiles().map(|t| t.coord).collect(),
                BufferShape::vector(k, design.input),
            ),
            dims.n_cores,
        )?;

        let mut mem_c = Vec::with_capacity(dims.n_cols);
        let mut out_c: Vec<Vec<ChannelHandle>> = Vec::with_capacity(dims.n_cols);
        for col in &topology.columns {
            let stage = stage_coord(col.column, &topology)?;
            let sources = col
                .compute
                .iter()
                .enumerate()
                .map(|(j, core)| {
                    builder.channel(ChannelSpec::new(
                        ChannelId::new(Tier::Compute, Tier::Stage, col.column, j),
                        format!("outC{}_{}", col.column, core.coord.row),
                        core.coord,
                        vec![stage],
                        BufferShape::vector(m, design.output),
                    ))
                })
                .collect::<CompileResult<Vec<_>>>()?;
            let target = builder.channel(ChannelSpec::new(
                ChannelId::new(Tier::Stage, Tier::Interface, col.column, 0),
                format!("memC{}", col.column),
                stage,
                vec![col.interface.coord],
                BufferShape::vector(m * cpc, design.output),
            ))?;
            builder.join(col.column, sources.clone(), target)?;
            out_c.push(sources);
            mem_c.push(target);
        }
        let network = builder.finish()?;

        let zero = KernelDecl::zero(design.variant, m);
        let matvec = KernelDecl::matvec(design.variant, m, k);
        let kernels = vec![zero.clone(), matvec.clone()];

        let loops = ComputeLoopGenerator::new(&network, &kernels);
        let mut tasks = Vec::with_capacity(dims.n_cores);
        for col in &topology.columns {
            for (j, core) in col.compute.iter().enumerate() {
                tasks.push(loops.matvec(
                    core.coord,
                    in_a[col.column][j],
                    in_b,
                    out_c[col.column][j],
                    plan.reduction_blocks,
                    &zero.symbol,
                    &matvec.symbol,
                )?);
            }
        }

        let mut descriptors =
            DescriptorGenerator::new(&network, &buffers, self.config.interface_bd_slots);
        descriptors.matvec_vector(&plan, in_b, buffers[1].id, design.input)?;
        for column in 0..dims.n_cols {
            descriptors.matvec_matrix(&plan, column, mem_a[column], buffers[0].id, design.input)?;
            descriptors.matvec_output(&plan, column, mem_c[column], buffers[2].id, design.output)?;
        }
        let sequence = SyncBarrier::plan(descriptors.finish()?);
        sequence.validate_ops(&sequence.ops())?;

        self.finish(DesignPlan::MatVec(plan), topology, network, kernels, tasks, buffers, sequence)
    }

    /// Map a stream pass-through. One core per column gives the two-tier
    /// design; more cores route each column through its stage tile.
    pub fn generate_stream(&self, dims: &StreamDims) -> CompileResult<MeshProgram> {
        let plan = StreamPlanner::new(*dims).plan()?;
        let cpc = dims.cores_per_column;
        let staged = cpc > 1;
        let topology = TopologyModel::build(&self.config, dims.n_cols, cpc, staged)?;

        let words = dims.element.to_words(dims.length)?;
        let buffers = vec![
            HostBuffer {
                id: HostBufferId(0),
                name: "in".to_string(),
                element: dims.element,
                words,
                direction: Direction::HostToDevice,
            },
            HostBuffer {
                id: HostBufferId(1),
                name: "out".to_string(),
                element: dims.element,
                words,
                direction: Direction::DeviceToHost,
            },
        ];

        let line = BufferShape::vector(dims.line_len, dims.element);
        let mut builder = NetworkBuilder::new(&topology);
        // per column: host-facing (in, out) and per-core (in, out) handles
        let mut host_side = Vec::with_capacity(dims.n_cols);
        let mut core_side: Vec<Vec<(ChannelHandle, ChannelHandle)>> =
            Vec::with_capacity(dims.n_cols);

        for col in &topology.columns {
            let c = col.column;
            let iface = col.interface.coord;
            if !staged {
                let core = col.compute[0].coord;
                let input = builder.channel(ChannelSpec::new(
                    ChannelId::new(Tier::Interface, Tier::Compute, c, 0),
                    format!("in{}", c),
                    iface,
                    vec![core],
                    line.clone(),
                ))?;
                let output = builder.channel(ChannelSpec::new(
                    ChannelId::new(Tier::Compute, Tier::Interface, c, 0),
                    format!("out{}", c),
                    core,
                    vec![iface],
                    line.clone(),
                ))?;
                host_side.push((input, output));
                core_side.push(vec![(input, output)]);
                continue;
            }

            let stage = stage_coord(c, &topology)?;
            let wide = BufferShape::vector(dims.line_len * cpc, dims.element);
            let input = builder.channel(ChannelSpec::new(
                ChannelId::new(Tier::Interface, Tier::Stage, c, 0),
                format!("in{}", c),
                iface,
                vec![stage],
                wide.clone(),
            ))?;
            let output = builder.channel(ChannelSpec::new(
                ChannelId::new(Tier::Stage, Tier::Interface, c, 0),
                format!("out{}", c),
                stage,
                vec![iface],
                wide,
            ))?;
            let mut pairs = Vec::with_capacity(cpc);
            for (j, core) in col.compute.iter().enumerate() {
                let to_core = builder.channel(ChannelSpec::new(
                    ChannelId::new(Tier::Stage, Tier::Compute, c, j),
                    format!("to_compute{}_{}", j + 1, c),
                    stage,
                    vec![core.coord],
                    line.clone(),
                ))?;
                let from_core = builder.channel(ChannelSpec::new(
                    ChannelId::new(Tier::Compute, Tier::Stage, c, j),
                    format!("from_compute{}_{}", j + 1, c),
                    core.coord,
                    vec![stage],
                    line.clone(),
                ))?;
                pairs.push((to_core, from_core));
            }
            builder.distribute(c, input, pairs.iter().map(|p| p.0).collect())?;
            builder.join(c, pairs.iter().map(|p| p.1).collect(), output)?;
            host_side.push((input, output));
            core_side.push(pairs);
        }
        let network = builder.finish()?;

        let kernels = vec![KernelDecl::pass_through(dims.line_len, dims.element)];
        let loops = ComputeLoopGenerator::new(&network, &kernels);
        let mut tasks = Vec::new();
        for col in &topology.columns {
            for (core, &(input, output)) in col.compute.iter().zip(&core_side[col.column]) {
                tasks.push(loops.pass_through(core.coord, input, output, dims.line_len)?);
            }
        }

        let mut descriptors =
            DescriptorGenerator::new(&network, &buffers, self.config.interface_bd_slots);
        for (column, &(input, output)) in host_side.iter().enumerate() {
            descriptors.stream_column(&plan, column, input, buffers[0].id)?;
            descriptors.stream_column(&plan, column, output, buffers[1].id)?;
        }
        let sequence = SyncBarrier::plan(descriptors.finish()?);
        sequence.validate_ops(&sequence.ops())?;

        self.finish(DesignPlan::Stream(plan), topology, network, kernels, tasks, buffers, sequence)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        plan: DesignPlan,
        topology: TopologyModel,
        network: ChannelNetwork,
        kernels: Vec<KernelDecl>,
        tasks: Vec<ComputeTask>,
        buffers: Vec<HostBuffer>,
        sequence: HostSequence,
    ) -> CompileResult<MeshProgram> {
        let mut program = MeshProgram {
            config: self.config.clone(),
            plan,
            topology,
            network,
            kernels,
            tasks,
            buffers,
            sequence,
            summary: String::new(),
        };
        program.generate_summary();
        tracing::info!(
            channels = program.network.channels().len(),
            tasks = program.tasks.len(),
            descriptors = program.sequence.descriptors.len(),
            "mesh program generated"
        );
        Ok(program)
    }
}

fn stage_coord(column: usize, topology: &TopologyModel) -> CompileResult<TileCoord> {
    topology
        .column(column)?
        .stage
        .map(|s| s.coord)
        .ok_or_else(|| CompileError::topology(format!("column {} has no stage tile", column)))
}
