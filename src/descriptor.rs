//! Host transfer descriptors
//!
//! Every transfer between a flat host buffer and an interface channel is a
//! four-level walk: `sizes[0..4]` outermost to innermost, with `strides[0..3]`
//! for the three outer levels (the innermost level is contiguous). All
//! quantities are in 32-bit transfer words.
//!
//! The generator checks each descriptor as it is built: the words it moves
//! must match the bytes the plan assigns to that endpoint, and its walk must
//! stay inside the host buffer. When all descriptors exist, it checks that
//! descriptors of one buffer never overlap and together cover it exactly.

use std::collections::HashMap;
use std::ops::Range;

use serde::Serialize;

use crate::channel::{ChannelHandle, ChannelNetwork};
use crate::error::{CompileError, CompileResult};
use crate::hardware::{ElementType, Tier, TileCoord, TRANSFER_WORD_BYTES};
use crate::tiling::{StreamPlan, TilingPlan};

/// Direction of a host transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Direction {
    /// Host buffer into the mesh
    HostToDevice,
    /// Mesh into a host buffer
    DeviceToHost,
}

/// Index of a host buffer in a program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HostBufferId(pub usize);

/// A flat host buffer handed to the program at invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostBuffer {
    pub id: HostBufferId,
    pub name: String,
    pub element: ElementType,
    /// Length in transfer words
    pub words: usize,
    pub direction: Direction,
}

impl HostBuffer {
    pub fn bytes(&self) -> usize {
        self.words * TRANSFER_WORD_BYTES
    }
}

/// One multi-dimensional host transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferDescriptor {
    pub channel: ChannelHandle,
    pub channel_name: String,
    pub interface: TileCoord,
    pub direction: Direction,
    /// Buffer-descriptor slot on the interface tile
    pub slot: usize,
    pub buffer: HostBufferId,
    pub offsets: [usize; 4],
    pub sizes: [usize; 4],
    pub strides: [usize; 3],
}

impl TransferDescriptor {
    pub fn word_count(&self) -> usize {
        self.sizes.iter().product()
    }

    pub fn byte_count(&self) -> usize {
        self.word_count() * TRANSFER_WORD_BYTES
    }

    /// First word touched
    pub fn base(&self) -> usize {
        self.offsets[3]
            + self.offsets[2] * self.strides[2]
            + self.offsets[1] * self.strides[1]
            + self.offsets[0] * self.strides[0]
    }

    /// Start of every contiguous innermost run, in transfer order.
    fn run_starts(&self) -> impl Iterator<Item = usize> + '_ {
        let base = self.base();
        let [s0, s1, s2] = self.strides;
        (0..self.sizes[0]).flat_map(move |i0| {
            (0..self.sizes[1]).flat_map(move |i1| {
                (0..self.sizes[2]).map(move |i2| base + i0 * s0 + i1 * s1 + i2 * s2)
            })
        })
    }

    /// Word addresses in transfer order.
    pub fn addresses(&self) -> Vec<usize> {
        let run = self.sizes[3];
        self.run_starts().flat_map(|start| start..start + run).collect()
    }

    /// Last word touched plus one
    pub fn end(&self) -> usize {
        let last = self.sizes[0].saturating_sub(1) * self.strides[0]
            + self.sizes[1].saturating_sub(1) * self.strides[1]
            + self.sizes[2].saturating_sub(1) * self.strides[2]
            + self.sizes[3];
        self.base() + last
    }

    /// Distinct words touched, as sorted non-overlapping ranges. A level with
    /// stride 0 re-reads the same region and adds nothing here.
    pub fn footprint(&self) -> Vec<Range<usize>> {
        let run = self.sizes[3];
        let mut runs: Vec<Range<usize>> = self.run_starts().map(|s| s..s + run).collect();
        runs.sort_by_key(|r| r.start);
        let mut merged: Vec<Range<usize>> = Vec::with_capacity(runs.len());
        for r in runs {
            match merged.last_mut() {
                Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
                _ => merged.push(r),
            }
        }
        merged
    }
}

/// Hands out buffer-descriptor slots round-robin per interface tile.
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    limit: usize,
    next: HashMap<TileCoord, usize>,
}

impl SlotAllocator {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            next: HashMap::new(),
        }
    }

    /// Next free slot of `tile`. Every descriptor of an invocation is
    /// outstanding at once, so slots are never reused within one program.
    pub fn assign(&mut self, tile: TileCoord) -> CompileResult<usize> {
        let next = self.next.entry(tile).or_insert(0);
        if *next >= self.limit {
            return Err(CompileError::descriptor(format!(
                "interface tile {} has no free descriptor slot ({} in use)",
                tile, self.limit
            )));
        }
        let slot = *next;
        *next += 1;
        Ok(slot)
    }
}

/// Raw request for one descriptor
#[derive(Debug, Clone)]
pub struct DescriptorRequest {
    pub channel: ChannelHandle,
    pub buffer: HostBufferId,
    pub offsets: [usize; 4],
    pub sizes: [usize; 4],
    pub strides: [usize; 3],
    /// Bytes the plan assigns to this endpoint
    pub expected_bytes: usize,
}

/// Builds the transfer descriptors of one program
pub struct DescriptorGenerator<'a> {
    network: &'a ChannelNetwork,
    buffers: &'a [HostBuffer],
    slots: SlotAllocator,
    descriptors: Vec<TransferDescriptor>,
}

impl<'a> DescriptorGenerator<'a> {
    pub fn new(network: &'a ChannelNetwork, buffers: &'a [HostBuffer], slot_limit: usize) -> Self {
        Self {
            network,
            buffers,
            slots: SlotAllocator::new(slot_limit),
            descriptors: Vec::new(),
        }
    }

    /// The shared vector, replayed once per row block of every core.
    ///
    /// Level 0 repeats with stride 0 (a logical broadcast), level 1 walks
    /// the reduction blocks, level 2 is the single row of the vector and
    /// level 3 is one reduction block.
    pub fn matvec_vector(
        &mut self,
        plan: &TilingPlan,
        channel: ChannelHandle,
        buffer: HostBufferId,
        element: ElementType,
    ) -> CompileResult<()> {
        let k_words = element.to_words(plan.dims.block_cols)?;
        let row_words = element.to_words(plan.dims.cols)?;
        self.emit(DescriptorRequest {
            channel,
            buffer,
            offsets: [0; 4],
            sizes: [plan.row_blocks_per_core, plan.reduction_blocks, 1, k_words],
            strides: [0, k_words, row_words],
            expected_bytes: plan.row_blocks_per_core * plan.dims.cols * element.bytes(),
        })
    }

    /// The rows of the matrix owned by `column`.
    ///
    /// Level 0 walks row-block groups of `cores_per_column * m` rows, level 1
    /// the reduction blocks, level 2 the rows of a group and level 3 one
    /// reduction block of a row.
    pub fn matvec_matrix(
        &mut self,
        plan: &TilingPlan,
        column: usize,
        channel: ChannelHandle,
        buffer: HostBufferId,
        element: ElementType,
    ) -> CompileResult<()> {
        let slice = plan
            .columns
            .get(column)
            .ok_or_else(|| CompileError::descriptor(format!("plan has no column {}", column)))?;
        let k_words = element.to_words(plan.dims.block_cols)?;
        let row_words = element.to_words(plan.dims.cols)?;
        let group_rows = plan.cores_per_column * plan.dims.block_rows;
        let offset = column * slice.row_blocks * plan.dims.block_rows * row_words;
        self.emit(DescriptorRequest {
            channel,
            buffer,
            offsets: [0, 0, 0, offset],
            sizes: [plan.row_blocks_per_core, plan.reduction_blocks, group_rows, k_words],
            strides: [group_rows * row_words, k_words, row_words],
            expected_bytes: slice.rows.len() * plan.dims.cols * element.bytes(),
        })
    }

    /// The output rows drained from `column`, one contiguous copy.
    pub fn matvec_output(
        &mut self,
        plan: &TilingPlan,
        column: usize,
        channel: ChannelHandle,
        buffer: HostBufferId,
        element: ElementType,
    ) -> CompileResult<()> {
        let slice = plan
            .columns
            .get(column)
            .ok_or_else(|| CompileError::descriptor(format!("plan has no column {}", column)))?;
        let words = element.to_words(slice.rows.len())?;
        let offset = element.to_words(slice.rows.start)?;
        self.emit(DescriptorRequest {
            channel,
            buffer,
            offsets: [0, 0, 0, offset],
            sizes: [1, 1, 1, words],
            strides: [0, 0, 0],
            expected_bytes: slice.rows.len() * element.bytes(),
        })
    }

    /// One column's slice of a stream, in or out; both directions use the
    /// same offset.
    pub fn stream_column(
        &mut self,
        plan: &StreamPlan,
        column: usize,
        channel: ChannelHandle,
        buffer: HostBufferId,
    ) -> CompileResult<()> {
        let range = plan
            .columns
            .get(column)
            .ok_or_else(|| CompileError::descriptor(format!("plan has no column {}", column)))?;
        let element = plan.dims.element;
        let words = element.to_words(range.len())?;
        let offset = element.to_words(range.start)?;
        self.emit(DescriptorRequest {
            channel,
            buffer,
            offsets: [0, 0, 0, offset],
            sizes: [1, 1, 1, words],
            strides: [0, 0, 0],
            expected_bytes: range.len() * element.bytes(),
        })
    }

    /// Validate and record one descriptor.
    pub fn emit(&mut self, request: DescriptorRequest) -> CompileResult<()> {
        let channel = self.network.get(request.channel)?;
        let (interface, direction) = if channel.id.from == Tier::Interface {
            (channel.producers[0], Direction::HostToDevice)
        } else if channel.id.to == Tier::Interface {
            (channel.consumers[0], Direction::DeviceToHost)
        } else {
            return Err(CompileError::descriptor(format!(
                "channel '{}' does not touch an interface tile",
                channel.name
            )));
        };

        let buffer = self
            .buffers
            .iter()
            .find(|b| b.id == request.buffer)
            .ok_or_else(|| {
                CompileError::descriptor(format!("unknown host buffer {}", request.buffer.0))
            })?;
        if buffer.direction != direction {
            return Err(CompileError::descriptor(format!(
                "buffer '{}' is {:?} but channel '{}' is {:?}",
                buffer.name, buffer.direction, channel.name, direction
            )));
        }

        let descriptor = TransferDescriptor {
            channel: request.channel,
            channel_name: channel.name.clone(),
            interface,
            direction,
            slot: 0,
            buffer: request.buffer,
            offsets: request.offsets,
            sizes: request.sizes,
            strides: request.strides,
        };

        if descriptor.word_count() == 0 {
            return Err(CompileError::descriptor(format!(
                "empty transfer on channel '{}'",
                channel.name
            )));
        }
        if descriptor.byte_count() != request.expected_bytes {
            return Err(CompileError::descriptor(format!(
                "transfer on '{}' moves {} bytes, its endpoint owns {}",
                channel.name,
                descriptor.byte_count(),
                request.expected_bytes
            )));
        }
        if descriptor.end() > buffer.words {
            return Err(CompileError::descriptor(format!(
                "transfer on '{}' reaches word {} of buffer '{}' ({} words)",
                channel.name,
                descriptor.end(),
                buffer.name,
                buffer.words
            )));
        }
        if descriptor.byte_count() % channel.slot_bytes() != 0 {
            return Err(CompileError::descriptor(format!(
                "transfer on '{}' of {} bytes is not a whole number of {}-byte slots",
                channel.name,
                descriptor.byte_count(),
                channel.slot_bytes()
            )));
        }

        let slot = self.slots.assign(interface)?;
        let descriptor = TransferDescriptor { slot, ..descriptor };
        tracing::debug!(
            channel = %descriptor.channel_name,
            slot,
            sizes = ?descriptor.sizes,
            strides = ?descriptor.strides,
            offset = descriptor.base(),
            "transfer descriptor"
        );
        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Check per-buffer coverage and return the descriptors in issue order.
    pub fn finish(self) -> CompileResult<Vec<TransferDescriptor>> {
        for buffer in self.buffers {
            check_coverage(buffer, &self.descriptors)?;
        }
        Ok(self.descriptors)
    }
}

/// Descriptors of `buffer` must not overlap each other and must cover it
/// exactly once.
pub fn check_coverage(
    buffer: &HostBuffer,
    descriptors: &[TransferDescriptor],
) -> CompileResult<()> {
    let mut runs: Vec<(Range<usize>, usize)> = descriptors
        .iter()
        .enumerate()
        .filter(|(_, d)| d.buffer == buffer.id)
        .flat_map(|(i, d)| d.footprint().into_iter().map(move |r| (r, i)))
        .collect();
    runs.sort_by_key(|(r, _)| r.start);

    let mut covered = 0;
    for (range, owner) in &runs {
        if range.start < covered {
            return Err(CompileError::descriptor(format!(
                "descriptor {} overlaps another transfer of buffer '{}' at word {}",
                owner, buffer.name, range.start
            )));
        }
        if range.start > covered {
            break;
        }
        covered = range.end;
    }
    if covered != buffer.words {
        return Err(CompileError::descriptor(format!(
            "transfers of buffer '{}' cover words 0..{} of {}",
            buffer.name, covered, buffer.words
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelId, ChannelSpec, NetworkBuilder};
    use crate::codegen::{CodeGenerator, MatVecDesign};
    use crate::hardware::{BufferShape, MeshConfig};
    use crate::tiling::ProblemDims;
    use crate::topology::TopologyModel;

    /// One interface-to-compute channel with 64-byte slots.
    fn interface_network() -> ChannelNetwork {
        let topology = TopologyModel::build(&MeshConfig::npu_4col(), 1, 1, false).unwrap();
        let mut builder = NetworkBuilder::new(&topology);
        builder
            .channel(ChannelSpec::new(
                ChannelId::new(Tier::Interface, Tier::Compute, 0, 0),
                "in0",
                TileCoord::new(0, 0),
                vec![TileCoord::new(0, 2)],
                BufferShape::vector(16, ElementType::I32),
            ))
            .unwrap();
        builder.finish().unwrap()
    }

    fn request(offset: usize, words: usize, expected_bytes: usize) -> DescriptorRequest {
        DescriptorRequest {
            channel: ChannelHandle(0),
            buffer: HostBufferId(0),
            offsets: [0, 0, 0, offset],
            sizes: [1, 1, 1, words],
            strides: [0, 0, 0],
            expected_bytes,
        }
    }

    fn descriptor(offset: usize, sizes: [usize; 4], strides: [usize; 3]) -> TransferDescriptor {
        TransferDescriptor {
            channel: ChannelHandle(0),
            channel_name: "c".to_string(),
            interface: TileCoord::new(0, 0),
            direction: Direction::HostToDevice,
            slot: 0,
            buffer: HostBufferId(0),
            offsets: [0, 0, 0, offset],
            sizes,
            strides,
        }
    }

    fn buffer(words: usize) -> HostBuffer {
        HostBuffer {
            id: HostBufferId(0),
            name: "buf".to_string(),
            element: ElementType::I32,
            words,
            direction: Direction::HostToDevice,
        }
    }

    #[test]
    fn test_addresses_walk_innermost_first() {
        let d = descriptor(10, [1, 2, 2, 2], [0, 2, 8]);
        assert_eq!(d.addresses(), vec![10, 11, 18, 19, 12, 13, 20, 21]);
        assert_eq!(d.word_count(), 8);
        assert_eq!(d.end(), 22);
    }

    #[test]
    fn test_broadcast_footprint_collapses_repeats() {
        let d = descriptor(0, [3, 4, 1, 8], [0, 8, 32]);
        assert_eq!(d.word_count(), 96);
        assert_eq!(d.footprint(), vec![0..32]);
    }

    #[test]
    fn test_slots_round_robin_per_tile() {
        let mut slots = SlotAllocator::new(2);
        let a = TileCoord::new(0, 0);
        let b = TileCoord::new(1, 0);
        assert_eq!(slots.assign(a), Ok(0));
        assert_eq!(slots.assign(b), Ok(0));
        assert_eq!(slots.assign(a), Ok(1));
        assert!(slots.assign(a).is_err());
    }

    #[test]
    fn test_coverage_detects_gap_and_overlap() {
        let halves = [
            descriptor(0, [1, 1, 1, 16], [0, 0, 0]),
            descriptor(16, [1, 1, 1, 16], [0, 0, 0]),
        ];
        assert!(check_coverage(&buffer(32), &halves).is_ok());
        assert!(check_coverage(&buffer(40), &halves).is_err());

        let overlapping = [
            descriptor(0, [1, 1, 1, 20], [0, 0, 0]),
            descriptor(16, [1, 1, 1, 16], [0, 0, 0]),
        ];
        let err = check_coverage(&buffer(32), &overlapping).unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn test_emit_rejects_bad_requests() {
        let network = interface_network();
        let buffers = [buffer(32)];
        let mut generator = DescriptorGenerator::new(&network, &buffers, 16);

        let empty = generator.emit(request(0, 0, 0)).unwrap_err();
        assert!(matches!(empty, CompileError::DescriptorError { .. }));
        assert!(empty.to_string().contains("empty transfer"));

        let short = generator.emit(request(0, 16, 128)).unwrap_err();
        assert!(matches!(short, CompileError::DescriptorError { .. }));
        assert!(short.to_string().contains("moves 64 bytes"));

        let past_end = generator.emit(request(24, 16, 64)).unwrap_err();
        assert!(matches!(past_end, CompileError::DescriptorError { .. }));
        assert!(past_end.to_string().contains("reaches word 40"));

        generator.emit(request(0, 16, 64)).unwrap();
        generator.emit(request(16, 16, 64)).unwrap();
        let descriptors = generator.finish().unwrap();
        assert_eq!(
            descriptors.iter().map(|d| d.slot).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[test]
    fn test_matvec_exhausts_descriptor_slots() {
        // interface (1, 0) issues inB, memA1 and memC1
        let config = MeshConfig {
            interface_bd_slots: 2,
            ..MeshConfig::npu_4col()
        };
        let design = MatVecDesign::new(ProblemDims::new(512, 256, 32, 64, 8, 4));
        let err = CodeGenerator::new(config)
            .generate_matvec(&design)
            .unwrap_err();
        assert!(matches!(err, CompileError::DescriptorError { .. }));
        assert!(err.to_string().contains("(1, 0)"));
    }
}
