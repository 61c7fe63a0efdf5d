//! Per-tile compute loops
//!
//! Each compute tile runs one persistent loop that never ends on its own:
//! acquire the output slot, reset it, accumulate over the reduction steps
//! while acquiring and releasing one input slot per step, then release the
//! output slot. The generator emits the loop body as data so a lowering
//! backend (or the simulator in [`crate::runtime`]) can consume it.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::channel::{ChannelHandle, ChannelNetwork};
use crate::error::{CompileError, CompileResult};
use crate::hardware::{BufferShape, ElementType, TileCoord};

/// Object file holding the matrix-vector kernels
pub const MATVEC_OBJECT: &str = "mv.o";
/// Object file holding the pass-through kernel
pub const PASS_THROUGH_OBJECT: &str = "passThrough.cc.o";
/// Symbol of the pass-through kernel
pub const PASS_THROUGH_SYMBOL: &str = "passThroughLine";

/// Implementation flavour of the matrix-vector kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum KernelVariant {
    Scalar,
    #[default]
    Vectorized,
}

impl KernelVariant {
    pub(crate) fn tag(self) -> &'static str {
        match self {
            KernelVariant::Scalar => "scalar",
            KernelVariant::Vectorized => "vectorized",
        }
    }
}

/// One parameter of an external kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum KernelParam {
    Buffer(BufferShape),
    Scalar,
}

/// Declaration of an opaque external kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelDecl {
    pub symbol: String,
    pub object: String,
    pub params: Vec<KernelParam>,
}

impl KernelDecl {
    /// Zero an `m`-element f32 accumulator.
    pub fn zero(variant: KernelVariant, m: usize) -> Self {
        Self {
            symbol: format!("zero_{}_f32", variant.tag()),
            object: MATVEC_OBJECT.to_string(),
            params: vec![KernelParam::Buffer(BufferShape::vector(m, ElementType::F32))],
        }
    }

    /// Accumulate an `m`x`k` bf16 block times a `k` bf16 vector into `m` f32.
    pub fn matvec(variant: KernelVariant, m: usize, k: usize) -> Self {
        Self {
            symbol: format!("matvec_{}_bf16_f32", variant.tag()),
            object: MATVEC_OBJECT.to_string(),
            params: vec![
                KernelParam::Buffer(BufferShape::matrix(m, k, ElementType::Bf16)),
                KernelParam::Buffer(BufferShape::vector(k, ElementType::Bf16)),
                KernelParam::Buffer(BufferShape::vector(m, ElementType::F32)),
            ],
        }
    }

    /// Copy one line of `line_len` elements.
    pub fn pass_through(line_len: usize, element: ElementType) -> Self {
        Self {
            symbol: PASS_THROUGH_SYMBOL.to_string(),
            object: PASS_THROUGH_OBJECT.to_string(),
            params: vec![
                KernelParam::Buffer(BufferShape::vector(line_len, element)),
                KernelParam::Buffer(BufferShape::vector(line_len, element)),
                KernelParam::Scalar,
            ],
        }
    }
}

/// Which end of a channel a tile holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Port {
    Produce,
    Consume,
}

/// Argument of a kernel call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum KernelArg {
    /// The slot currently held on a channel
    Slot(ChannelHandle),
    Int(i32),
}

/// One step of a compute loop body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LoopOp {
    Acquire { channel: ChannelHandle, port: Port },
    Release { channel: ChannelHandle, port: Port },
    Call { kernel: String, args: Vec<KernelArg> },
    Repeat { count: usize, body: Vec<LoopOp> },
}

/// The persistent loop of one compute tile
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComputeTask {
    pub tile: TileCoord,
    pub inputs: Vec<ChannelHandle>,
    pub output: ChannelHandle,
    pub reduction_trips: usize,
    pub object: String,
    /// Body of the unbounded outer loop
    pub body: Vec<LoopOp>,
}

impl ComputeTask {
    /// Walk one iteration of the body and check the acquire/release pairing:
    /// no double acquire, no release of an unheld slot, kernel arguments only
    /// reference held slots, and nothing is left held at the end.
    pub fn check_protocol(&self) -> CompileResult<()> {
        let mut held = HashSet::new();
        check_ops(&self.body, &mut held)?;
        if !held.is_empty() {
            return Err(CompileError::topology(format!(
                "compute loop on {} ends an iteration still holding {} slot(s)",
                self.tile,
                held.len()
            )));
        }
        Ok(())
    }

    /// Kernel calls per iteration of the outer loop
    pub fn calls_per_iteration(&self) -> usize {
        count_calls(&self.body)
    }
}

fn check_ops(ops: &[LoopOp], held: &mut HashSet<(ChannelHandle, Port)>) -> CompileResult<()> {
    for op in ops {
        match op {
            LoopOp::Acquire { channel, port } => {
                if !held.insert((*channel, *port)) {
                    return Err(CompileError::topology(format!(
                        "channel {} acquired twice without a release",
                        channel.0
                    )));
                }
            }
            LoopOp::Release { channel, port } => {
                if !held.remove(&(*channel, *port)) {
                    return Err(CompileError::topology(format!(
                        "channel {} released without an acquire",
                        channel.0
                    )));
                }
            }
            LoopOp::Call { kernel, args } => {
                for arg in args {
                    if let KernelArg::Slot(channel) = arg {
                        if !held.iter().any(|(c, _)| c == channel) {
                            return Err(CompileError::signature(
                                kernel.clone(),
                                format!("argument channel {} is not held", channel.0),
                            ));
                        }
                    }
                }
            }
            LoopOp::Repeat { body, .. } => {
                let before = held.clone();
                check_ops(body, held)?;
                if *held != before {
                    return Err(CompileError::topology(
                        "repeated block does not release what it acquires",
                    ));
                }
            }
        }
    }
    Ok(())
}

fn count_calls(ops: &[LoopOp]) -> usize {
    ops.iter()
        .map(|op| match op {
            LoopOp::Call { .. } => 1,
            LoopOp::Repeat { count, body } => count * count_calls(body),
            _ => 0,
        })
        .sum()
}

/// Emits compute loops and checks them against kernel signatures
pub struct ComputeLoopGenerator<'a> {
    network: &'a ChannelNetwork,
    kernels: HashMap<String, KernelDecl>,
}

impl<'a> ComputeLoopGenerator<'a> {
    pub fn new(network: &'a ChannelNetwork, kernels: &[KernelDecl]) -> Self {
        Self {
            network,
            kernels: kernels
                .iter()
                .map(|k| (k.symbol.clone(), k.clone()))
                .collect(),
        }
    }

    /// Reset the output, then accumulate `reduction_trips` matrix blocks
    /// against vector blocks into it.
    pub fn matvec(
        &self,
        tile: TileCoord,
        matrix: ChannelHandle,
        vector: ChannelHandle,
        output: ChannelHandle,
        reduction_trips: usize,
        zero: &str,
        matvec: &str,
    ) -> CompileResult<ComputeTask> {
        self.endpoint(tile, output, Port::Produce)?;
        self.endpoint(tile, matrix, Port::Consume)?;
        self.endpoint(tile, vector, Port::Consume)?;

        let zero_args = vec![KernelArg::Slot(output)];
        let matvec_args = vec![
            KernelArg::Slot(matrix),
            KernelArg::Slot(vector),
            KernelArg::Slot(output),
        ];
        self.check_call(zero, &zero_args)?;
        self.check_call(matvec, &matvec_args)?;

        let body = vec![
            LoopOp::Acquire { channel: output, port: Port::Produce },
            LoopOp::Call { kernel: zero.to_string(), args: zero_args },
            LoopOp::Repeat {
                count: reduction_trips,
                body: vec![
                    LoopOp::Acquire { channel: matrix, port: Port::Consume },
                    LoopOp::Acquire { channel: vector, port: Port::Consume },
                    LoopOp::Call { kernel: matvec.to_string(), args: matvec_args },
                    LoopOp::Release { channel: matrix, port: Port::Consume },
                    LoopOp::Release { channel: vector, port: Port::Consume },
                ],
            },
            LoopOp::Release { channel: output, port: Port::Produce },
        ];
        self.task(tile, vec![matrix, vector], output, reduction_trips, matvec, body)
    }

    /// Copy each input line to the output.
    pub fn pass_through(
        &self,
        tile: TileCoord,
        input: ChannelHandle,
        output: ChannelHandle,
        line_len: usize,
    ) -> CompileResult<ComputeTask> {
        self.endpoint(tile, output, Port::Produce)?;
        self.endpoint(tile, input, Port::Consume)?;

        let len = i32::try_from(line_len).map_err(|_| {
            CompileError::signature(
                PASS_THROUGH_SYMBOL,
                format!("line length {} overflows i32", line_len),
            )
        })?;
        let args = vec![KernelArg::Slot(input), KernelArg::Slot(output), KernelArg::Int(len)];
        self.check_call(PASS_THROUGH_SYMBOL, &args)?;

        let body = vec![
            LoopOp::Acquire { channel: output, port: Port::Produce },
            LoopOp::Acquire { channel: input, port: Port::Consume },
            LoopOp::Call { kernel: PASS_THROUGH_SYMBOL.to_string(), args },
            LoopOp::Release { channel: input, port: Port::Consume },
            LoopOp::Release { channel: output, port: Port::Produce },
        ];
        self.task(tile, vec![input], output, 1, PASS_THROUGH_SYMBOL, body)
    }

    fn task(
        &self,
        tile: TileCoord,
        inputs: Vec<ChannelHandle>,
        output: ChannelHandle,
        reduction_trips: usize,
        main_kernel: &str,
        body: Vec<LoopOp>,
    ) -> CompileResult<ComputeTask> {
        let object = self
            .kernels
            .get(main_kernel)
            .map(|k| k.object.clone())
            .ok_or_else(|| CompileError::signature(main_kernel, "kernel is not declared"))?;
        let task = ComputeTask {
            tile,
            inputs,
            output,
            reduction_trips,
            object,
            body,
        };
        task.check_protocol()?;
        tracing::debug!(
            tile = %tile,
            kernel = main_kernel,
            reduction_trips,
            "compute loop generated"
        );
        Ok(task)
    }

    fn endpoint(&self, tile: TileCoord, channel: ChannelHandle, port: Port) -> CompileResult<()> {
        let ch = self.network.get(channel)?;
        let ends = match port {
            Port::Produce => &ch.producers,
            Port::Consume => &ch.consumers,
        };
        if !ends.contains(&tile) {
            return Err(CompileError::topology(format!(
                "tile {} is not a {:?} endpoint of channel '{}'",
                tile, port, ch.name
            )));
        }
        Ok(())
    }

    fn check_call(&self, kernel: &str, args: &[KernelArg]) -> CompileResult<()> {
        let decl = self
            .kernels
            .get(kernel)
            .ok_or_else(|| CompileError::signature(kernel, "kernel is not declared"))?;
        if decl.params.len() != args.len() {
            return Err(CompileError::signature(
                kernel,
                format!("takes {} arguments, call passes {}", decl.params.len(), args.len()),
            ));
        }
        for (i, (param, arg)) in decl.params.iter().zip(args).enumerate() {
            match (param, arg) {
                (KernelParam::Buffer(shape), KernelArg::Slot(handle)) => {
                    let channel = self.network.get(*handle)?;
                    if !channel.shape.same_footprint(shape) {
                        return Err(CompileError::signature(
                            kernel,
                            format!(
                                "argument {} expects {}, channel '{}' carries {}",
                                i, shape, channel.name, channel.shape
                            ),
                        ));
                    }
                }
                (KernelParam::Scalar, KernelArg::Int(_)) => {}
                _ => {
                    return Err(CompileError::signature(
                        kernel,
                        format!("argument {} has the wrong kind", i),
                    ))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelId, ChannelSpec, NetworkBuilder};
    use crate::hardware::{MeshConfig, Tier};
    use crate::topology::TopologyModel;

    fn two_tier(line: usize) -> (ChannelNetwork, ChannelHandle, ChannelHandle) {
        let topo = TopologyModel::build(&MeshConfig::npu_4col(), 1, 1, false).unwrap();
        let mut b = NetworkBuilder::new(&topo);
        let iface = TileCoord::new(0, 0);
        let core = TileCoord::new(0, 2);
        let input = b
            .channel(ChannelSpec::new(
                ChannelId::new(Tier::Interface, Tier::Compute, 0, 0),
                "in0",
                iface,
                vec![core],
                BufferShape::vector(line, ElementType::U8),
            ))
            .unwrap();
        let output = b
            .channel(ChannelSpec::new(
                ChannelId::new(Tier::Compute, Tier::Interface, 0, 0),
                "out0",
                core,
                vec![iface],
                BufferShape::vector(line, ElementType::U8),
            ))
            .unwrap();
        (b.finish().unwrap(), input, output)
    }

    #[test]
    fn test_pass_through_loop() {
        let (network, input, output) = two_tier(32);
        let kernels = [KernelDecl::pass_through(32, ElementType::U8)];
        let gen = ComputeLoopGenerator::new(&network, &kernels);
        let task = gen.pass_through(TileCoord::new(0, 2), input, output, 32).unwrap();
        assert_eq!(task.object, PASS_THROUGH_OBJECT);
        assert_eq!(task.calls_per_iteration(), 1);
        assert_eq!(
            task.body[0],
            LoopOp::Acquire { channel: output, port: Port::Produce }
        );
    }

    #[test]
    fn test_signature_mismatch() {
        let (network, input, output) = two_tier(32);
        let kernels = [KernelDecl::pass_through(64, ElementType::U8)];
        let gen = ComputeLoopGenerator::new(&network, &kernels);
        let err = gen
            .pass_through(TileCoord::new(0, 2), input, output, 64)
            .unwrap_err();
        assert!(matches!(err, CompileError::KernelSignature { .. }));
    }

    #[test]
    fn test_wrong_endpoint() {
        let (network, input, output) = two_tier(32);
        let kernels = [KernelDecl::pass_through(32, ElementType::U8)];
        let gen = ComputeLoopGenerator::new(&network, &kernels);
        // output and input swapped
        assert!(gen.pass_through(TileCoord::new(0, 2), output, input, 32).is_err());
    }

    #[test]
    fn test_protocol_rejects_unbalanced_repeat() {
        let task = ComputeTask {
            tile: TileCoord::new(0, 2),
            inputs: vec![ChannelHandle(0)],
            output: ChannelHandle(1),
            reduction_trips: 2,
            object: MATVEC_OBJECT.to_string(),
            body: vec![LoopOp::Repeat {
                count: 2,
                body: vec![LoopOp::Acquire { channel: ChannelHandle(0), port: Port::Consume }],
            }],
        };
        assert!(task.check_protocol().is_err());
    }

    #[test]
    fn test_kernel_names() {
        assert_eq!(KernelDecl::zero(KernelVariant::Vectorized, 64).symbol, "zero_vectorized_f32");
        assert_eq!(
            KernelDecl::matvec(KernelVariant::Scalar, 64, 64).symbol,
            "matvec_scalar_bf16_f32"
        );
    }
}
