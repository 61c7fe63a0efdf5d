//! Thread-per-tile simulator
//!
//! Every compute task, stage link and interface channel runs on its own
//! scoped thread. Each consumer endpoint of a channel owns a pair of bounded
//! queues: `full` carries filled slots to the consumer, `free` returns them
//! to the producer. The free queue starts with `depth` zeroed slots, so a
//! producer blocks exactly when all slots are in flight.
//!
//! There is no explicit shutdown message. When the last producer of a queue
//! goes away the consumer drains what is left and then sees a disconnect,
//! which ends its loop; teardown ripples from the interface tiles inward.

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use serde::Serialize;

use crate::channel::{ChannelHandle, ChannelNetwork, Link};
use crate::codegen::MeshProgram;
use crate::compute::{ComputeTask, KernelArg, LoopOp, Port};
use crate::descriptor::{Direction, TransferDescriptor};
use crate::error::{CompileError, CompileResult};
use crate::hardware::{Tier, TileCoord, TRANSFER_WORD_BYTES};
use crate::kernels::KernelRegistry;
use crate::sync::{Barrier, TransferGroup};

type Slot = Vec<u8>;

/// Slot accounting of one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortStats {
    pub channel: String,
    pub port: Port,
    pub acquired: usize,
    pub released: usize,
    /// Slot still held when the endpoint shut down
    pub abandoned: usize,
}

impl PortStats {
    fn new(channel: &str, port: Port) -> Self {
        Self {
            channel: channel.to_string(),
            port,
            acquired: 0,
            released: 0,
            abandoned: 0,
        }
    }
}

/// What one simulated tile did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileReport {
    pub tile: TileCoord,
    pub tier: Tier,
    /// Completed outer-loop iterations, or slots moved for non-compute tiles
    pub iterations: usize,
    pub ports: Vec<PortStats>,
}

/// Result of one invocation
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    /// Host memory after the invocation, indexed by buffer id
    pub buffers: Vec<Vec<u8>>,
    pub reports: Vec<TileReport>,
    /// Barriers in the order they retired
    pub retired: Vec<Barrier>,
}

impl Execution {
    pub fn buffer(&self, program: &MeshProgram, name: &str) -> Option<&[u8]> {
        lookup(&self.buffers, program, name)
    }
}

/// One pass of the host sequence inside a [`Session`]
#[derive(Debug, Clone, Serialize)]
pub struct Invocation {
    pub buffers: Vec<Vec<u8>>,
    pub retired: Vec<Barrier>,
    /// From the first issue to the last retired barrier
    pub elapsed: Duration,
}

impl Invocation {
    pub fn buffer(&self, program: &MeshProgram, name: &str) -> Option<&[u8]> {
        lookup(&self.buffers, program, name)
    }
}

/// Repeated invocations against one loaded program. Tiles stay up for the
/// whole session, so their reports cover every invocation.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub invocations: Vec<Invocation>,
    pub reports: Vec<TileReport>,
}

fn lookup<'b>(buffers: &'b [Vec<u8>], program: &MeshProgram, name: &str) -> Option<&'b [u8]> {
    program
        .buffer(name)
        .and_then(|b| buffers.get(b.id.0))
        .map(Vec::as_slice)
}

struct Lane {
    free: Receiver<Slot>,
    full: Sender<Slot>,
}

/// Produce side of one channel on one tile; one lane per consumer
struct ProducerPort {
    lanes: Vec<Lane>,
    held: Option<Vec<Slot>>,
    stats: PortStats,
}

impl ProducerPort {
    /// `Ok(false)` once the consumers are gone.
    fn acquire(&mut self) -> CompileResult<bool> {
        if self.held.is_some() {
            return Err(CompileError::runtime(format!(
                "producer on '{}' acquired twice without a release",
                self.stats.channel
            )));
        }
        let mut slots = Vec::with_capacity(self.lanes.len());
        for lane in &self.lanes {
            match lane.free.recv() {
                Ok(slot) => slots.push(slot),
                Err(_) => return Ok(false),
            }
        }
        self.stats.acquired += 1;
        self.held = Some(slots);
        Ok(true)
    }

    fn slot_mut(&mut self) -> CompileResult<&mut Slot> {
        let channel = &self.stats.channel;
        self.held
            .as_mut()
            .and_then(|slots| slots.first_mut())
            .ok_or_else(|| CompileError::runtime(format!("no slot held on '{}'", channel)))
    }

    /// Publish the held slot to every consumer.
    fn release(&mut self) -> CompileResult<bool> {
        let mut slots = self.held.take().ok_or_else(|| {
            CompileError::runtime(format!("release of unheld slot on '{}'", self.stats.channel))
        })?;
        if let Some((first, rest)) = slots.split_first_mut() {
            for copy in rest {
                copy.copy_from_slice(first);
            }
        }
        for (lane, slot) in self.lanes.iter().zip(slots) {
            if lane.full.send(slot).is_err() {
                return Ok(false);
            }
        }
        self.stats.released += 1;
        Ok(true)
    }

    fn finish(mut self) -> PortStats {
        if self.held.is_some() {
            self.stats.abandoned += 1;
        }
        self.stats
    }
}

/// Consume side of one channel on one tile
struct ConsumerPort {
    full: Receiver<Slot>,
    free: Sender<Slot>,
    held: Option<Slot>,
    stats: PortStats,
}

impl ConsumerPort {
    /// `Ok(false)` once every producer is gone and the queue is drained.
    fn acquire(&mut self) -> CompileResult<bool> {
        if self.held.is_some() {
            return Err(CompileError::runtime(format!(
                "consumer on '{}' acquired twice without a release",
                self.stats.channel
            )));
        }
        match self.full.recv() {
            Ok(slot) => {
                self.stats.acquired += 1;
                self.held = Some(slot);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    fn slot(&self) -> CompileResult<&[u8]> {
        self.held.as_deref().ok_or_else(|| {
            CompileError::runtime(format!("no slot held on '{}'", self.stats.channel))
        })
    }

    fn release(&mut self) -> CompileResult<()> {
        let slot = self.held.take().ok_or_else(|| {
            CompileError::runtime(format!("release of unheld slot on '{}'", self.stats.channel))
        })?;
        // the producer may already have finished
        let _ = self.free.send(slot);
        self.stats.released += 1;
        Ok(())
    }

    fn finish(mut self) -> PortStats {
        if self.held.is_some() {
            self.stats.abandoned += 1;
        }
        self.stats
    }
}

/// Endpoints of every channel, handed out to the tile threads
struct Wiring {
    producers: HashMap<(ChannelHandle, TileCoord), ProducerPort>,
    consumers: HashMap<(ChannelHandle, TileCoord), ConsumerPort>,
}

impl Wiring {
    fn new(network: &ChannelNetwork) -> CompileResult<Self> {
        let mut producers = HashMap::new();
        let mut consumers = HashMap::new();
        for (handle, channel) in network.handles().zip(network.channels()) {
            let slot_bytes = channel.slot_bytes();
            let mut lanes = Vec::with_capacity(channel.consumers.len());
            for &consumer in &channel.consumers {
                let (full_tx, full_rx) = bounded(channel.depth);
                let (free_tx, free_rx) = bounded(channel.depth);
                for _ in 0..channel.depth {
                    free_tx.try_send(vec![0u8; slot_bytes]).map_err(|_| {
                        CompileError::runtime(format!("cannot prime slots of '{}'", channel.name))
                    })?;
                }
                consumers.insert(
                    (handle, consumer),
                    ConsumerPort {
                        full: full_rx,
                        free: free_tx,
                        held: None,
                        stats: PortStats::new(&channel.name, Port::Consume),
                    },
                );
                lanes.push((free_rx, full_tx));
            }
            for &producer in &channel.producers {
                let lanes = lanes
                    .iter()
                    .map(|(free, full)| Lane {
                        free: free.clone(),
                        full: full.clone(),
                    })
                    .collect();
                producers.insert(
                    (handle, producer),
                    ProducerPort {
                        lanes,
                        held: None,
                        stats: PortStats::new(&channel.name, Port::Produce),
                    },
                );
            }
        }
        Ok(Self { producers, consumers })
    }

    fn producer(&mut self, channel: ChannelHandle, tile: TileCoord) -> CompileResult<ProducerPort> {
        self.producers.remove(&(channel, tile)).ok_or_else(|| {
            CompileError::runtime(format!(
                "{} has no free produce end on channel {}",
                tile, channel.0
            ))
        })
    }

    fn consumer(&mut self, channel: ChannelHandle, tile: TileCoord) -> CompileResult<ConsumerPort> {
        self.consumers.remove(&(channel, tile)).ok_or_else(|| {
            CompileError::runtime(format!(
                "{} has no free consume end on channel {}",
                tile, channel.0
            ))
        })
    }
}

/// Signalled by an interface thread once its descriptors of one invocation
/// are done; device-to-host channels carry the received bytes per descriptor.
struct Completion {
    group: TransferGroup,
    drained: Vec<(usize, Vec<u8>)>,
}

/// Runs a [`MeshProgram`] on host threads
pub struct MeshRuntime<'a> {
    program: &'a MeshProgram,
    kernels: &'a KernelRegistry,
}

impl<'a> MeshRuntime<'a> {
    pub fn new(program: &'a MeshProgram, kernels: &'a KernelRegistry) -> Self {
        Self { program, kernels }
    }

    /// Execute one invocation. `inputs` holds the contents of every input
    /// buffer, in buffer order; outputs start zeroed.
    pub fn run(&self, inputs: &[&[u8]]) -> CompileResult<Execution> {
        let session = self.run_repeated(inputs, 1)?;
        let invocation = session
            .invocations
            .into_iter()
            .next()
            .ok_or_else(|| CompileError::runtime("no invocation completed"))?;
        Ok(Execution {
            buffers: invocation.buffers,
            reports: session.reports,
            retired: invocation.retired,
        })
    }

    /// Load the program once and issue its host sequence `count` times.
    ///
    /// Every invocation issues all descriptors, then waits for every barrier
    /// before the next one starts. Compute loops carry on across invocations
    /// and are only torn down after the last one.
    pub fn run_repeated(&self, inputs: &[&[u8]], count: usize) -> CompileResult<Session> {
        let program = self.program;
        let memory = self.host_memory(inputs)?;
        for task in &program.tasks {
            self.check_kernels(&task.body)?;
        }
        if count == 0 {
            return Err(CompileError::runtime("at least one invocation is required"));
        }

        let mut by_channel: Vec<(ChannelHandle, Vec<usize>)> = Vec::new();
        for (i, desc) in program.sequence.descriptors.iter().enumerate() {
            match by_channel.iter_mut().find(|(h, _)| *h == desc.channel) {
                Some((_, list)) => list.push(i),
                None => by_channel.push((desc.channel, vec![i])),
            }
        }
        let mut channels_per_group: HashMap<TransferGroup, usize> = HashMap::new();
        for (_, list) in &by_channel {
            let group = TransferGroup::of(&program.sequence.descriptors[list[0]]);
            *channels_per_group.entry(group).or_default() += 1;
        }

        let mut wiring = Wiring::new(&program.network)?;
        let (done_tx, done_rx) = unbounded::<CompileResult<Completion>>();
        let network = &program.network;
        let kernels = self.kernels;
        let host: &[Vec<u8>] = &memory;

        let (results, invocations, failure) = thread::scope(|s| -> CompileResult<_> {
            let mut handles = Vec::new();
            let mut issuers = Vec::with_capacity(by_channel.len());

            for task in &program.tasks {
                let mut inputs = HashMap::new();
                for &h in &task.inputs {
                    inputs.insert(h, wiring.consumer(h, task.tile)?);
                }
                let output = wiring.producer(task.output, task.tile)?;
                handles.push(s.spawn(move || run_compute(task, inputs, output, kernels)));
            }

            for link in network.links() {
                match link {
                    Link::FanOut { stage, source, targets } => {
                        let source_port = wiring.consumer(*source, *stage)?;
                        let mut target_ports = Vec::with_capacity(targets.len());
                        for &t in targets {
                            target_ports.push((t, wiring.producer(t, *stage)?));
                        }
                        let stage = *stage;
                        handles.push(s.spawn(move || {
                            fan_out(stage, network, source_port, target_ports)
                        }));
                    }
                    Link::FanIn { stage, sources, target } => {
                        let mut source_ports = Vec::with_capacity(sources.len());
                        for &h in sources {
                            source_ports.push(wiring.consumer(h, *stage)?);
                        }
                        let target_port = wiring.producer(*target, *stage)?;
                        let stage = *stage;
                        handles.push(s.spawn(move || fan_in(stage, source_ports, target_port)));
                    }
                }
            }

            for (channel, list) in &by_channel {
                let descs: Vec<(usize, &TransferDescriptor)> = list
                    .iter()
                    .map(|&i| (i, &program.sequence.descriptors[i]))
                    .collect();
                let first = descs[0].1;
                let slot_bytes = network.get(*channel)?.slot_bytes();
                let done = done_tx.clone();
                let (issue_tx, issued) = unbounded::<()>();
                issuers.push(issue_tx);
                match first.direction {
                    Direction::HostToDevice => {
                        let port = wiring.producer(*channel, first.interface)?;
                        handles.push(s.spawn(move || {
                            mm2s(descs, host, slot_bytes, port, issued, done)
                        }));
                    }
                    Direction::DeviceToHost => {
                        let port = wiring.consumer(*channel, first.interface)?;
                        handles.push(s.spawn(move || s2mm(descs, port, issued, done)));
                    }
                }
            }

            // unclaimed endpoints must not keep queues alive
            drop(wiring);
            drop(done_tx);

            let mut invocations = Vec::with_capacity(count);
            let mut failure = None;
            for n in 0..count {
                match await_invocation(program, host, &issuers, &done_rx, &channels_per_group) {
                    Ok(invocation) => {
                        tracing::debug!(
                            invocation = n,
                            elapsed = ?invocation.elapsed,
                            "invocation complete"
                        );
                        invocations.push(invocation);
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            // no more issues: interface threads return and teardown ripples inward
            drop(issuers);

            let results: Vec<CompileResult<TileReport>> = handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(CompileError::runtime("tile thread panicked")))
                })
                .collect();
            Ok((results, invocations, failure))
        })?;

        let reports = results.into_iter().collect::<CompileResult<Vec<_>>>()?;
        if let Some(e) = failure {
            return Err(e);
        }

        tracing::info!(
            tiles = reports.len(),
            invocations = invocations.len(),
            "session complete"
        );
        Ok(Session {
            invocations,
            reports,
        })
    }

    fn host_memory(&self, inputs: &[&[u8]]) -> CompileResult<Vec<Vec<u8>>> {
        let expected = self.program.input_buffers().count();
        if inputs.len() != expected {
            return Err(CompileError::runtime(format!(
                "expected {} input buffers, got {}",
                expected,
                inputs.len()
            )));
        }
        let mut given = inputs.iter();
        let mut memory = Vec::with_capacity(self.program.buffers.len());
        for buffer in &self.program.buffers {
            match buffer.direction {
                Direction::HostToDevice => {
                    let data = given.next().copied().unwrap_or_default();
                    if data.len() != buffer.bytes() {
                        return Err(CompileError::runtime(format!(
                            "input '{}' holds {} bytes, expected {}",
                            buffer.name,
                            data.len(),
                            buffer.bytes()
                        )));
                    }
                    memory.push(data.to_vec());
                }
                Direction::DeviceToHost => memory.push(vec![0u8; buffer.bytes()]),
            }
        }
        Ok(memory)
    }

    fn check_kernels(&self, ops: &[LoopOp]) -> CompileResult<()> {
        for op in ops {
            match op {
                LoopOp::Call { kernel, .. } if !self.kernels.contains(kernel) => {
                    return Err(CompileError::runtime(format!("no kernel bound to '{}'", kernel)));
                }
                LoopOp::Repeat { body, .. } => self.check_kernels(body)?,
                _ => {}
            }
        }
        Ok(())
    }
}

/// Issue every descriptor, then wait until each barrier has retired.
fn await_invocation(
    program: &MeshProgram,
    host: &[Vec<u8>],
    issuers: &[Sender<()>],
    done: &Receiver<CompileResult<Completion>>,
    channels_per_group: &HashMap<TransferGroup, usize>,
) -> CompileResult<Invocation> {
    let start = Instant::now();
    for issue in issuers {
        issue
            .send(())
            .map_err(|_| CompileError::runtime("interface thread left before the issue"))?;
    }

    let expected = program.sequence.barriers.len();
    let mut pending = channels_per_group.clone();
    let mut retired = Vec::with_capacity(expected);
    let mut drained = Vec::new();
    while retired.len() < expected {
        let completion = done.recv().map_err(|_| {
            CompileError::runtime(format!("{} of {} barriers retired", retired.len(), expected))
        })??;
        drained.extend(completion.drained);
        let group = completion.group;
        if let Some(left) = pending.get_mut(&group) {
            *left -= 1;
            if *left == 0 {
                tracing::debug!(
                    interface = %group.interface,
                    direction = ?group.direction,
                    "barrier retired"
                );
                retired.push(Barrier { group });
            }
        }
    }
    let elapsed = start.elapsed();

    let mut buffers = host.to_vec();
    for (index, data) in drained {
        let desc = &program.sequence.descriptors[index];
        let buffer = &mut buffers[desc.buffer.0];
        for (word, addr) in data.chunks_exact(TRANSFER_WORD_BYTES).zip(desc.addresses()) {
            let start = addr * TRANSFER_WORD_BYTES;
            buffer[start..start + TRANSFER_WORD_BYTES].copy_from_slice(word);
        }
    }
    Ok(Invocation {
        buffers,
        retired,
        elapsed,
    })
}

/// Convenience wrapper around [`MeshRuntime::run`].
pub fn execute(
    program: &MeshProgram,
    kernels: &KernelRegistry,
    inputs: &[&[u8]],
) -> CompileResult<Execution> {
    MeshRuntime::new(program, kernels).run(inputs)
}

struct ComputeTile<'k> {
    inputs: HashMap<ChannelHandle, ConsumerPort>,
    output: (ChannelHandle, ProducerPort),
    kernels: &'k KernelRegistry,
}

impl ComputeTile<'_> {
    /// `Ok(false)` on teardown.
    fn run_ops(&mut self, ops: &[LoopOp]) -> CompileResult<bool> {
        for op in ops {
            match op {
                LoopOp::Acquire { channel, port } => {
                    let live = match port {
                        Port::Consume => self.input(*channel)?.acquire()?,
                        Port::Produce => self.output(*channel)?.acquire()?,
                    };
                    if !live {
                        return Ok(false);
                    }
                }
                LoopOp::Release { channel, port } => match port {
                    Port::Consume => self.input(*channel)?.release()?,
                    Port::Produce => {
                        if !self.output(*channel)?.release()? {
                            return Ok(false);
                        }
                    }
                },
                LoopOp::Call { kernel, args } => self.call(kernel, args)?,
                LoopOp::Repeat { count, body } => {
                    for _ in 0..*count {
                        if !self.run_ops(body)? {
                            return Ok(false);
                        }
                    }
                }
            }
        }
        Ok(true)
    }

    fn call(&mut self, kernel: &str, args: &[KernelArg]) -> CompileResult<()> {
        let mut slots = Vec::new();
        let mut scalars = Vec::new();
        for arg in args {
            match arg {
                KernelArg::Slot(h) if *h == self.output.0 => {}
                KernelArg::Slot(h) => {
                    let port = self.inputs.get(h).ok_or_else(|| {
                        CompileError::runtime(format!(
                            "kernel '{}' reads unknown channel {}",
                            kernel, h.0
                        ))
                    })?;
                    slots.push(port.slot()?);
                }
                KernelArg::Int(v) => scalars.push(*v),
            }
        }
        let out = self.output.1.slot_mut()?;
        self.kernels.get(kernel)?.invoke(&slots, out, &scalars)
    }

    fn input(&mut self, channel: ChannelHandle) -> CompileResult<&mut ConsumerPort> {
        self.inputs.get_mut(&channel).ok_or_else(|| {
            CompileError::runtime(format!("tile does not consume channel {}", channel.0))
        })
    }

    fn output(&mut self, channel: ChannelHandle) -> CompileResult<&mut ProducerPort> {
        if channel != self.output.0 {
            return Err(CompileError::runtime(format!(
                "tile does not produce channel {}",
                channel.0
            )));
        }
        Ok(&mut self.output.1)
    }
}

fn run_compute(
    task: &ComputeTask,
    inputs: HashMap<ChannelHandle, ConsumerPort>,
    output: ProducerPort,
    kernels: &KernelRegistry,
) -> CompileResult<TileReport> {
    let mut tile = ComputeTile {
        inputs,
        output: (task.output, output),
        kernels,
    };
    let mut iterations = 0;
    while tile.run_ops(&task.body)? {
        iterations += 1;
    }
    tracing::debug!(tile = %task.tile, iterations, "compute loop stopped");

    let mut ports: Vec<PortStats> = task
        .inputs
        .iter()
        .filter_map(|h| tile.inputs.remove(h))
        .map(ConsumerPort::finish)
        .collect();
    ports.push(tile.output.1.finish());
    Ok(TileReport {
        tile: task.tile,
        tier: Tier::Compute,
        iterations,
        ports,
    })
}

fn fan_out(
    stage: TileCoord,
    network: &ChannelNetwork,
    mut source: ConsumerPort,
    mut targets: Vec<(ChannelHandle, ProducerPort)>,
) -> CompileResult<TileReport> {
    let mut iterations = 0;
    'outer: while source.acquire()? {
        let mut offset = 0;
        for (handle, port) in targets.iter_mut() {
            let channel = network.get(*handle)?;
            if !port.acquire()? {
                break 'outer;
            }
            let data = source.slot()?;
            let len = channel.slot_bytes();
            let chunk = data.get(offset..offset + len).ok_or_else(|| {
                CompileError::runtime(format!("'{}' overruns its source slot", channel.name))
            })?;
            let slot = port.slot_mut()?;
            match &channel.access_pattern {
                Some(pattern) => {
                    slot.copy_from_slice(&pattern.apply(chunk, channel.shape.element.bytes()))
                }
                None => slot.copy_from_slice(chunk),
            }
            offset += len;
            if !port.release()? {
                break 'outer;
            }
        }
        source.release()?;
        iterations += 1;
    }
    tracing::trace!(stage = %stage, iterations, "fan-out drained");

    let mut ports = vec![source.finish()];
    ports.extend(targets.into_iter().map(|(_, p)| p.finish()));
    Ok(TileReport {
        tile: stage,
        tier: Tier::Stage,
        iterations,
        ports,
    })
}

fn fan_in(
    stage: TileCoord,
    mut sources: Vec<ConsumerPort>,
    mut target: ProducerPort,
) -> CompileResult<TileReport> {
    let mut iterations = 0;
    'outer: while target.acquire()? {
        let mut offset = 0;
        for port in sources.iter_mut() {
            if !port.acquire()? {
                break 'outer;
            }
            let data = port.slot()?;
            let slot = target.slot_mut()?;
            let dest = slot.get_mut(offset..offset + data.len()).ok_or_else(|| {
                CompileError::runtime(format!("'{}' overruns its target slot", port.stats.channel))
            })?;
            dest.copy_from_slice(data);
            offset += data.len();
            port.release()?;
        }
        if !target.release()? {
            break;
        }
        iterations += 1;
    }
    tracing::trace!(stage = %stage, iterations, "fan-in drained");

    let mut ports: Vec<PortStats> = sources.into_iter().map(ConsumerPort::finish).collect();
    ports.push(target.finish());
    Ok(TileReport {
        tile: stage,
        tier: Tier::Stage,
        iterations,
        ports,
    })
}

/// Host-to-device transfers of one channel: on every issue, gather the
/// words of each descriptor and push them as slots.
fn mm2s(
    descriptors: Vec<(usize, &TransferDescriptor)>,
    host: &[Vec<u8>],
    slot_bytes: usize,
    mut port: ProducerPort,
    issued: Receiver<()>,
    done: Sender<CompileResult<Completion>>,
) -> CompileResult<TileReport> {
    let group = first_group(&descriptors)?;
    let mut slots = 0;
    while issued.recv().is_ok() {
        if let Err(e) = push_descriptors(&descriptors, host, slot_bytes, &mut port, &mut slots) {
            let _ = done.send(Err(e.clone()));
            return Err(e);
        }
        let _ = done.send(Ok(Completion {
            group,
            drained: Vec::new(),
        }));
    }
    Ok(TileReport {
        tile: group.interface,
        tier: Tier::Interface,
        iterations: slots,
        ports: vec![port.finish()],
    })
}

fn push_descriptors(
    descriptors: &[(usize, &TransferDescriptor)],
    host: &[Vec<u8>],
    slot_bytes: usize,
    port: &mut ProducerPort,
    slots: &mut usize,
) -> CompileResult<()> {
    for &(index, desc) in descriptors {
        let buffer = host.get(desc.buffer.0).ok_or_else(|| {
            CompileError::runtime(format!("descriptor {} names an unknown buffer", index))
        })?;
        let mut stream = Vec::with_capacity(desc.byte_count());
        for addr in desc.addresses() {
            let start = addr * TRANSFER_WORD_BYTES;
            let word = buffer.get(start..start + TRANSFER_WORD_BYTES).ok_or_else(|| {
                CompileError::runtime(format!(
                    "descriptor {} reads past '{}'",
                    index, desc.channel_name
                ))
            })?;
            stream.extend_from_slice(word);
        }
        for chunk in stream.chunks(slot_bytes) {
            let left = || {
                CompileError::runtime(format!(
                    "consumers of '{}' left before descriptor {} finished",
                    desc.channel_name, index
                ))
            };
            if !port.acquire()? {
                return Err(left());
            }
            port.slot_mut()?.copy_from_slice(chunk);
            if !port.release()? {
                return Err(left());
            }
            *slots += 1;
        }
        tracing::trace!(descriptor = index, channel = %desc.channel_name, "transfer issued");
    }
    Ok(())
}

/// Device-to-host transfers of one channel: on every issue, collect exactly
/// the bytes each descriptor expects.
fn s2mm(
    descriptors: Vec<(usize, &TransferDescriptor)>,
    mut port: ConsumerPort,
    issued: Receiver<()>,
    done: Sender<CompileResult<Completion>>,
) -> CompileResult<TileReport> {
    let group = first_group(&descriptors)?;
    let mut slots = 0;
    while issued.recv().is_ok() {
        match drain_descriptors(&descriptors, &mut port, &mut slots) {
            Ok(drained) => {
                let _ = done.send(Ok(Completion { group, drained }));
            }
            Err(e) => {
                let _ = done.send(Err(e.clone()));
                return Err(e);
            }
        }
    }
    Ok(TileReport {
        tile: group.interface,
        tier: Tier::Interface,
        iterations: slots,
        ports: vec![port.finish()],
    })
}

fn drain_descriptors(
    descriptors: &[(usize, &TransferDescriptor)],
    port: &mut ConsumerPort,
    slots: &mut usize,
) -> CompileResult<Vec<(usize, Vec<u8>)>> {
    let mut drained = Vec::with_capacity(descriptors.len());
    for &(index, desc) in descriptors {
        let mut data = Vec::with_capacity(desc.byte_count());
        while data.len() < desc.byte_count() {
            if !port.acquire()? {
                return Err(CompileError::runtime(format!(
                    "'{}' closed after {} of {} bytes for descriptor {}",
                    desc.channel_name,
                    data.len(),
                    desc.byte_count(),
                    index
                )));
            }
            let want = desc.byte_count() - data.len();
            let slot = port.slot()?;
            data.extend_from_slice(&slot[..want.min(slot.len())]);
            port.release()?;
            *slots += 1;
        }
        drained.push((index, data));
    }
    Ok(drained)
}

fn first_group(descriptors: &[(usize, &TransferDescriptor)]) -> CompileResult<TransferGroup> {
    descriptors
        .first()
        .map(|(_, desc)| TransferGroup::of(desc))
        .ok_or_else(|| CompileError::runtime("interface thread started without descriptors"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::CodeGenerator;
    use crate::hardware::{ElementType, MeshConfig};
    use crate::tiling::StreamDims;
    use pretty_assertions::assert_eq;

    fn stream_program(n_cols: usize, cpc: usize) -> MeshProgram {
        let dims = StreamDims {
            length: 1024,
            element: ElementType::U8,
            n_cols,
            cores_per_column: cpc,
            line_len: 64,
        };
        CodeGenerator::new(MeshConfig::npu_4col())
            .generate_stream(&dims)
            .unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_two_tier_stream_copies_input() {
        let program = stream_program(2, 1);
        let input = pattern(1024);
        let run = execute(&program, &KernelRegistry::reference(), &[&input]).unwrap();
        assert_eq!(run.buffer(&program, "out").unwrap(), input.as_slice());
        assert_eq!(run.retired.len(), program.sequence.barriers.len());
    }

    #[test]
    fn test_staged_stream_copies_input() {
        let program = stream_program(2, 2);
        let input = pattern(1024);
        let run = execute(&program, &KernelRegistry::reference(), &[&input]).unwrap();
        assert_eq!(run.buffer(&program, "out").unwrap(), input.as_slice());

        // 1024 bytes over 2 columns of 2 cores, 64-byte lines
        for report in run.reports.iter().filter(|r| r.tier == Tier::Compute) {
            assert_eq!(report.iterations, 4);
            for port in &report.ports {
                assert!(port.acquired - port.released <= 1);
            }
        }
    }

    #[test]
    fn test_repeated_invocations_reuse_the_tiles() {
        let program = stream_program(2, 2);
        let input = pattern(1024);
        let kernels = KernelRegistry::reference();
        let session = MeshRuntime::new(&program, &kernels)
            .run_repeated(&[&input], 3)
            .unwrap();

        assert_eq!(session.invocations.len(), 3);
        for invocation in &session.invocations {
            assert_eq!(invocation.buffer(&program, "out").unwrap(), input.as_slice());
            assert_eq!(invocation.retired.len(), program.sequence.barriers.len());
        }
        for report in &session.reports {
            for port in &report.ports {
                assert_eq!(port.acquired, port.released + port.abandoned);
            }
        }
        // 4 lines per core and invocation, on the same compute threads
        for report in session.reports.iter().filter(|r| r.tier == Tier::Compute) {
            assert_eq!(report.iterations, 12);
        }
    }

    #[test]
    fn test_zero_invocations_rejected() {
        let program = stream_program(1, 1);
        let input = pattern(1024);
        let kernels = KernelRegistry::reference();
        let err = MeshRuntime::new(&program, &kernels)
            .run_repeated(&[&input], 0)
            .unwrap_err();
        assert!(matches!(err, CompileError::RuntimeError { .. }));
    }

    #[test]
    fn test_wrong_input_length_rejected() {
        let program = stream_program(1, 1);
        let input = pattern(100);
        let err = execute(&program, &KernelRegistry::reference(), &[&input]).unwrap_err();
        assert!(matches!(err, CompileError::RuntimeError { .. }));
    }

    #[test]
    fn test_missing_kernel_rejected() {
        let program = stream_program(1, 1);
        let input = pattern(1024);
        let err = execute(&program, &KernelRegistry::new(), &[&input]).unwrap_err();
        assert!(matches!(err, CompileError::RuntimeError { .. }));
    }

    #[test]
    fn test_consumer_double_acquire_is_an_error() {
        let (full_tx, full_rx) = bounded(2);
        let (free_tx, _free_rx) = bounded(2);
        full_tx.send(vec![1u8]).unwrap();
        full_tx.send(vec![2u8]).unwrap();
        let mut port = ConsumerPort {
            full: full_rx,
            free: free_tx,
            held: None,
            stats: PortStats::new("c", Port::Consume),
        };
        assert_eq!(port.acquire(), Ok(true));
        assert!(port.acquire().is_err());
        port.release().unwrap();
        drop(full_tx);
        assert_eq!(port.acquire(), Ok(true));
        port.release().unwrap();
        assert_eq!(port.acquire(), Ok(false));
        let stats = port.finish();
        assert_eq!((stats.acquired, stats.released, stats.abandoned), (2, 2, 0));
    }
}
