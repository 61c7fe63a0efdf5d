//! Channel network between tiers
//!
//! A channel is a bounded queue of fixed-shape slots. Plain channels connect
//! tiles of two different tiers directly (a broadcast channel simply has
//! several consumers). Stage tiles never own free-standing channels: every
//! channel touching a stage is part of a [`Link`], either a fan-out that
//! splits one incoming slot into one slot per compute tile, or a fan-in
//! that concatenates one slot from each compute tile.
//!
//! The network is assembled with a [`NetworkBuilder`] and frozen into a
//! [`ChannelNetwork`] once every link has been checked.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;

use crate::error::{CompileError, CompileResult};
use crate::hardware::{BufferShape, Tier, TileCoord};
use crate::topology::TopologyModel;

/// Deepest nesting an access pattern may use
pub const MAX_PATTERN_LEVELS: usize = 3;

/// Reordering applied to a slot as it crosses a channel.
///
/// Each level is a `(repeat, stride)` pair, outermost first, in elements.
/// Walking all levels yields the source index of every element written, in
/// output order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AccessPattern {
    pub levels: Vec<(usize, usize)>,
}

impl AccessPattern {
    pub fn new(levels: Vec<(usize, usize)>) -> CompileResult<Self> {
        if levels.is_empty() || levels.len() > MAX_PATTERN_LEVELS {
            return Err(CompileError::topology(format!(
                "access pattern needs 1 to {} levels, got {}",
                MAX_PATTERN_LEVELS,
                levels.len()
            )));
        }
        if levels.iter().any(|&(repeat, _)| repeat == 0) {
            return Err(CompileError::topology("access pattern repeat counts must be non-zero"));
        }
        Ok(Self { levels })
    }

    /// Read an `rows`x`cols` row-major block column-pair by column-pair, so
    /// the consumer sees the block transposed at two-element granularity.
    pub fn pair_transpose(rows: usize, cols: usize) -> CompileResult<Self> {
        if cols % 2 != 0 {
            return Err(CompileError::tiling(format!(
                "pair transpose needs an even column count, got {}",
                cols
            )));
        }
        Self::new(vec![(cols / 2, 2), (rows, cols), (2, 1)])
    }

    pub fn element_count(&self) -> usize {
        self.levels.iter().map(|&(repeat, _)| repeat).product()
    }

    /// Source indices in output order.
    pub fn indices(&self) -> Vec<usize> {
        let mut out = vec![0usize];
        for &(repeat, stride) in &self.levels {
            out = out
                .iter()
                .flat_map(|&base| (0..repeat).map(move |i| base + i * stride))
                .collect();
        }
        out
    }

    /// The pattern must visit each of `elements` slot positions exactly once.
    pub fn validate_for(&self, elements: usize) -> CompileResult<()> {
        if self.element_count() != elements {
            return Err(CompileError::topology(format!(
                "access pattern moves {} elements, slot holds {}",
                self.element_count(),
                elements
            )));
        }
        let mut seen = vec![false; elements];
        for idx in self.indices() {
            match seen.get_mut(idx) {
                Some(slot) if !*slot => *slot = true,
                Some(_) => {
                    return Err(CompileError::topology(format!(
                        "access pattern reads element {} twice",
                        idx
                    )))
                }
                None => {
                    return Err(CompileError::topology(format!(
                        "access pattern reads element {} outside a slot of {}",
                        idx, elements
                    )))
                }
            }
        }
        Ok(())
    }

    /// Reorder a slot of raw bytes holding `element_bytes`-wide elements.
    pub fn apply(&self, input: &[u8], element_bytes: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());
        for idx in self.indices() {
            let start = idx * element_bytes;
            out.extend_from_slice(&input[start..start + element_bytes]);
        }
        out
    }
}

/// Structured channel identifier: tier pair, column and index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChannelId {
    pub from: Tier,
    pub to: Tier,
    pub column: usize,
    pub index: usize,
}

impl ChannelId {
    pub fn new(from: Tier, to: Tier, column: usize, index: usize) -> Self {
        Self {
            from,
            to,
            column,
            index,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}[{}.{}]", self.from, self.to, self.column, self.index)
    }
}

/// Index of a channel in its network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChannelHandle(pub usize);

/// A bounded queue between tiles
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub id: ChannelId,
    /// Symbol the lowering backend uses for this channel
    pub name: String,
    pub producers: Vec<TileCoord>,
    pub consumers: Vec<TileCoord>,
    pub depth: usize,
    pub shape: BufferShape,
    pub access_pattern: Option<AccessPattern>,
}

impl Channel {
    pub fn slot_bytes(&self) -> usize {
        self.shape.bytes()
    }
}

/// Request for a new channel
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub id: ChannelId,
    pub name: String,
    pub producers: Vec<TileCoord>,
    pub consumers: Vec<TileCoord>,
    pub shape: BufferShape,
    pub access_pattern: Option<AccessPattern>,
}

impl ChannelSpec {
    pub fn new(
        id: ChannelId,
        name: impl Into<String>,
        producer: TileCoord,
        consumers: Vec<TileCoord>,
        shape: BufferShape,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            producers: vec![producer],
            consumers,
            shape,
            access_pattern: None,
        }
    }

    pub fn with_pattern(mut self, pattern: AccessPattern) -> Self {
        self.access_pattern = Some(pattern);
        self
    }
}

/// A stage-tile node joining channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Link {
    /// One incoming slot is split, in order, into one slot per target.
    FanOut {
        stage: TileCoord,
        source: ChannelHandle,
        targets: Vec<ChannelHandle>,
    },
    /// One slot from each source, in order, is concatenated into the target.
    FanIn {
        stage: TileCoord,
        sources: Vec<ChannelHandle>,
        target: ChannelHandle,
    },
}

impl Link {
    /// Number of compute-side channels
    pub fn degree(&self) -> usize {
        match self {
            Link::FanOut { targets, .. } => targets.len(),
            Link::FanIn { sources, .. } => sources.len(),
        }
    }

    pub fn channels(&self) -> Vec<ChannelHandle> {
        match self {
            Link::FanOut { source, targets, .. } => {
                std::iter::once(*source).chain(targets.iter().copied()).collect()
            }
            Link::FanIn { sources, target, .. } => {
                sources.iter().copied().chain(std::iter::once(*target)).collect()
            }
        }
    }
}

/// Assembles and validates a [`ChannelNetwork`]
pub struct NetworkBuilder<'a> {
    topology: &'a TopologyModel,
    channels: Vec<Channel>,
    links: Vec<Link>,
    index: HashMap<ChannelId, ChannelHandle>,
    names: HashSet<String>,
}

impl<'a> NetworkBuilder<'a> {
    pub fn new(topology: &'a TopologyModel) -> Self {
        Self {
            topology,
            channels: Vec::new(),
            links: Vec::new(),
            index: HashMap::new(),
            names: HashSet::new(),
        }
    }

    /// Add a point-to-point or broadcast channel.
    pub fn channel(&mut self, spec: ChannelSpec) -> CompileResult<ChannelHandle> {
        if self.names.contains(&spec.name) {
            return Err(CompileError::topology(format!(
                "channel name '{}' is already taken",
                spec.name
            )));
        }
        if self.index.contains_key(&spec.id) {
            return Err(CompileError::topology(format!("channel {} already exists", spec.id)));
        }
        if spec.producers.is_empty() || spec.consumers.is_empty() {
            return Err(CompileError::topology(format!(
                "channel '{}' needs at least one producer and one consumer",
                spec.name
            )));
        }
        if spec.id.from == spec.id.to {
            return Err(CompileError::topology(format!(
                "channel '{}' connects {} to {}; channels must cross tiers",
                spec.name, spec.id.from, spec.id.to
            )));
        }
        for &coord in &spec.producers {
            self.expect_tier(&spec.name, coord, spec.id.from)?;
        }
        for &coord in &spec.consumers {
            self.expect_tier(&spec.name, coord, spec.id.to)?;
        }
        if spec.shape.is_empty() {
            return Err(CompileError::topology(format!(
                "channel '{}' has an empty slot",
                spec.name
            )));
        }
        if let Some(pattern) = &spec.access_pattern {
            pattern.validate_for(spec.shape.len())?;
        }

        let handle = ChannelHandle(self.channels.len());
        tracing::debug!(
            channel = %spec.name,
            id = %spec.id,
            producers = spec.producers.len(),
            consumers = spec.consumers.len(),
            shape = %spec.shape,
            "channel added"
        );
        self.names.insert(spec.name.clone());
        self.index.insert(spec.id, handle);
        self.channels.push(Channel {
            id: spec.id,
            name: spec.name,
            producers: spec.producers,
            consumers: spec.consumers,
            depth: self.topology.config.channel_depth,
            shape: spec.shape,
            access_pattern: spec.access_pattern,
        });
        Ok(handle)
    }

    /// Add a broadcast channel and check it reaches `expected` consumers.
    pub fn broadcast(
        &mut self,
        spec: ChannelSpec,
        expected: usize,
    ) -> CompileResult<ChannelHandle> {
        if spec.consumers.len() != expected {
            return Err(CompileError::topology(format!(
                "broadcast '{}' fans out to {} tiles, expected {}",
                spec.name,
                spec.consumers.len(),
                expected
            )));
        }
        self.channel(spec)
    }

    /// Link an interface-to-stage channel to one stage-to-compute channel
    /// per compute tile of `column`.
    pub fn distribute(
        &mut self,
        column: usize,
        source: ChannelHandle,
        targets: Vec<ChannelHandle>,
    ) -> CompileResult<()> {
        let (stage, expected) = self.stage_of(column)?;
        if targets.len() != expected {
            return Err(CompileError::topology(format!(
                "distribute in column {} has {} targets, column has {} compute tiles",
                column,
                targets.len(),
                expected
            )));
        }
        let src = self.get(source)?;
        if src.consumers != [stage] {
            return Err(CompileError::topology(format!(
                "distribute source '{}' must be consumed by stage {} only",
                src.name, stage
            )));
        }
        let mut total = 0;
        for &t in &targets {
            let target = self.get(t)?;
            if target.producers != [stage] || target.consumers.len() != 1 {
                return Err(CompileError::topology(format!(
                    "distribute target '{}' must run from stage {} to one compute tile",
                    target.name, stage
                )));
            }
            if target.shape.element != src.shape.element {
                return Err(CompileError::topology(format!(
                    "distribute target '{}' carries {}, source carries {}",
                    target.name, target.shape.element, src.shape.element
                )));
            }
            total += target.shape.len();
        }
        if total != src.shape.len() {
            return Err(CompileError::topology(format!(
                "distribute in column {} splits {} elements into {}",
                column,
                src.shape.len(),
                total
            )));
        }
        self.links.push(Link::FanOut {
            stage,
            source,
            targets,
        });
        Ok(())
    }

    /// Link one compute-to-stage channel per compute tile of `column` into a
    /// single stage-to-interface channel.
    pub fn join(
        &mut self,
        column: usize,
        sources: Vec<ChannelHandle>,
        target: ChannelHandle,
    ) -> CompileResult<()> {
        let (stage, expected) = self.stage_of(column)?;
        if sources.len() != expected {
            return Err(CompileError::topology(format!(
                "join in column {} has {} sources, column has {} compute tiles",
                column,
                sources.len(),
                expected
            )));
        }
        let tgt = self.get(target)?;
        if tgt.producers != [stage] {
            return Err(CompileError::topology(format!(
                "join target '{}' must be produced by stage {} only",
                tgt.name, stage
            )));
        }
        let mut total = 0;
        for &s in &sources {
            let source = self.get(s)?;
            if source.consumers != [stage] || source.producers.len() != 1 {
                return Err(CompileError::topology(format!(
                    "join source '{}' must run from one compute tile to stage {}",
                    source.name, stage
                )));
            }
            if source.shape.element != tgt.shape.element {
                return Err(CompileError::topology(format!(
                    "join source '{}' carries {}, target carries {}",
                    source.name, source.shape.element, tgt.shape.element
                )));
            }
            total += source.shape.len();
        }
        if total != tgt.shape.len() {
            return Err(CompileError::topology(format!(
                "join in column {} merges {} elements into {}",
                column,
                total,
                tgt.shape.len()
            )));
        }
        self.links.push(Link::FanIn {
            stage,
            sources,
            target,
        });
        Ok(())
    }

    /// Freeze the network after checking stage wiring and tile memory.
    pub fn finish(self) -> CompileResult<ChannelNetwork> {
        let mut linked: HashMap<ChannelHandle, usize> = HashMap::new();
        for link in &self.links {
            for handle in link.channels() {
                *linked.entry(handle).or_default() += 1;
            }
        }
        for (i, channel) in self.channels.iter().enumerate() {
            let touches_stage = channel.id.from == Tier::Stage || channel.id.to == Tier::Stage;
            let uses = linked.get(&ChannelHandle(i)).copied().unwrap_or(0);
            if touches_stage && uses != 1 {
                return Err(CompileError::topology(format!(
                    "stage channel '{}' belongs to {} links, expected exactly one",
                    channel.name, uses
                )));
            }
        }

        let mut usage: HashMap<TileCoord, usize> = HashMap::new();
        for channel in &self.channels {
            let bytes = channel.depth * channel.slot_bytes();
            let endpoints: HashSet<TileCoord> = channel
                .producers
                .iter()
                .chain(channel.consumers.iter())
                .copied()
                .collect();
            for coord in endpoints {
                *usage.entry(coord).or_default() += bytes;
            }
        }
        let mut usage: Vec<_> = usage.into_iter().collect();
        usage.sort();
        for (coord, bytes) in usage {
            let capacity = self.topology.tile(coord).and_then(|t| t.capacity);
            if let Some(capacity) = capacity {
                if bytes > capacity {
                    return Err(CompileError::topology(format!(
                        "channel buffers on tile {} need {} bytes, tile has {}",
                        coord, bytes, capacity
                    )));
                }
            }
        }

        Ok(ChannelNetwork {
            channels: self.channels,
            links: self.links,
            index: self.index,
        })
    }

    fn get(&self, handle: ChannelHandle) -> CompileResult<&Channel> {
        self.channels
            .get(handle.0)
            .ok_or_else(|| CompileError::topology(format!("unknown channel handle {}", handle.0)))
    }

    fn stage_of(&self, column: usize) -> CompileResult<(TileCoord, usize)> {
        let col = self.topology.column(column)?;
        let stage = col.stage.ok_or_else(|| {
            CompileError::topology(format!("column {} has no stage tile to link through", column))
        })?;
        Ok((stage.coord, col.compute.len()))
    }

    fn expect_tier(&self, name: &str, coord: TileCoord, tier: Tier) -> CompileResult<()> {
        let actual = self.topology.tier_of(coord)?;
        if actual != tier {
            return Err(CompileError::topology(format!(
                "channel '{}' expects a {} tile at {}, found {}",
                name, tier, coord, actual
            )));
        }
        Ok(())
    }
}

/// A frozen set of channels and stage links
#[derive(Debug, Clone, Serialize)]
pub struct ChannelNetwork {
    channels: Vec<Channel>,
    links: Vec<Link>,
    #[serde(skip)]
    index: HashMap<ChannelId, ChannelHandle>,
}

impl ChannelNetwork {
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn get(&self, handle: ChannelHandle) -> CompileResult<&Channel> {
        self.channels
            .get(handle.0)
            .ok_or_else(|| CompileError::topology(format!("unknown channel handle {}", handle.0)))
    }

    pub fn handle(&self, id: &ChannelId) -> Option<ChannelHandle> {
        self.index.get(id).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<ChannelHandle> {
        self.channels
            .iter()
            .position(|c| c.name == name)
            .map(ChannelHandle)
    }

    pub fn handles(&self) -> impl Iterator<Item = ChannelHandle> {
        (0..self.channels.len()).map(ChannelHandle)
    }

    /// Consumer endpoints reached through a link's compute side.
    pub fn link_endpoints(&self, link: &Link) -> usize {
        match link {
            Link::FanOut { targets, .. } => targets
                .iter()
                .filter_map(|h| self.channels.get(h.0))
                .map(|c| c.consumers.len())
                .sum(),
            Link::FanIn { sources, .. } => sources
                .iter()
                .filter_map(|h| self.channels.get(h.0))
                .map(|c| c.producers.len())
                .sum(),
        }
    }
}
