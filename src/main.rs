//! Tile Mesh Mapper CLI
//!
//! Usage:
//!   meshmap matvec -M 512 -K 256 --m 32 --k 64
//!   meshmap passthrough 4096 --cols 4 --cores-per-column 2 --simulate
//!   meshmap passthrough 4096 --iterations 10
//!   meshmap --mesh-config mesh.json matvec --json

use clap::{Parser as ClapParser, Subcommand};
use colored::Colorize;
use std::fs;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use tile_mesh_mapper::codegen::DesignPlan;
use tile_mesh_mapper::kernels::f32_to_bf16;
use tile_mesh_mapper::{
    compile_matvec, compile_stream, CompileResult, ElementType, KernelRegistry, KernelVariant,
    MatVecDesign, MeshConfig, MeshProgram, MeshRuntime, ProblemDims, StreamDims,
};

/// Runs excluded from the mean time when enough are requested
const WARMUP_RUNS: usize = 2;

#[derive(ClapParser, Debug)]
#[command(name = "meshmap")]
#[command(author = "FPGA Team")]
#[command(version = "0.1.0")]
#[command(about = "Maps tiled kernels onto a three-tier tile mesh")]
struct Args {
    #[command(subcommand)]
    design: Design,

    /// Load the mesh description from a JSON file
    #[arg(long = "mesh-config", global = true)]
    mesh_config: Option<String>,

    /// Output as JSON
    #[arg(short = 'j', long = "json", global = true)]
    json_output: bool,

    /// Run the program on the simulator and check the result
    #[arg(long = "simulate", global = true)]
    simulate: bool,

    /// Invocations of the loaded program; implies --simulate when above 1
    #[arg(long = "iterations", global = true, default_value = "1", value_parser = parse_iterations)]
    iterations: usize,

    /// Verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Design {
    /// Matrix-vector product spread over the whole array
    Matvec {
        #[arg(short = 'M', default_value = "288")]
        rows: usize,

        #[arg(short = 'K', default_value = "288")]
        cols: usize,

        /// Rows per block
        #[arg(long = "m", default_value = "64")]
        block_rows: usize,

        /// Columns per block
        #[arg(long = "k", default_value = "64")]
        block_cols: usize,

        #[arg(long = "cores", default_value = "8")]
        n_cores: usize,

        #[arg(long = "cols", default_value = "4")]
        n_cols: usize,

        /// Use the scalar kernel variants
        #[arg(long = "scalar")]
        scalar: bool,
    },
    /// Copy a u8 vector through the compute tiles
    Passthrough {
        #[arg(value_name = "VECTOR_SIZE", value_parser = parse_vector_size)]
        vector_size: usize,

        #[arg(long = "cols", default_value = "4")]
        n_cols: usize,

        #[arg(long = "cores-per-column", default_value = "1")]
        cores_per_column: usize,

        /// Elements per channel slot
        #[arg(long = "line", default_value = "64")]
        line_len: usize,
    },
}

fn parse_vector_size(s: &str) -> Result<usize, String> {
    let size = s
        .parse::<usize>()
        .map_err(|_| format!("Invalid vector size: {}", s))?;
    if size % 64 != 0 || size < 512 {
        return Err(
            "Vector size must be a multiple of 64 and greater than or equal to 512".to_string(),
        );
    }
    Ok(size)
}

fn parse_iterations(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("Invalid iteration count: {}", s)),
    }
}

fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.mesh_config {
        Some(path) => {
            let text = fs::read_to_string(path).unwrap_or_else(|e| {
                eprintln!("{}: Failed to read file '{}': {}", "Error".red(), path, e);
                std::process::exit(1);
            });
            MeshConfig::from_json(&text).unwrap_or_else(|e| {
                eprintln!("{}: Invalid mesh config '{}': {}", "Error".red(), path, e);
                std::process::exit(1);
            })
        }
        None => MeshConfig::npu_4col(),
    };

    let result = match args.design {
        Design::Matvec {
            rows,
            cols,
            block_rows,
            block_cols,
            n_cores,
            n_cols,
            scalar,
        } => {
            let dims = ProblemDims::new(rows, cols, block_rows, block_cols, n_cores, n_cols);
            let variant = if scalar {
                KernelVariant::Scalar
            } else {
                KernelVariant::Vectorized
            };
            compile_matvec(&MatVecDesign::new(dims).with_variant(variant), &config)
        }
        Design::Passthrough {
            vector_size,
            n_cols,
            cores_per_column,
            line_len,
        } => compile_stream(
            &StreamDims {
                length: vector_size,
                element: ElementType::U8,
                n_cols,
                cores_per_column,
                line_len,
            },
            &config,
        ),
    };

    let program = match result {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}: {}", "Compilation error".red(), e);
            std::process::exit(1);
        }
    };

    if args.json_output {
        match program.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("{}: Failed to serialize to JSON: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
    } else {
        print_program(&program, args.verbose);
    }

    if args.simulate || args.iterations > 1 {
        match simulate(&program, args.iterations, args.verbose) {
            Ok(true) => {}
            Ok(false) => std::process::exit(1),
            Err(e) => {
                eprintln!("{}: {}", "Simulation error".red(), e);
                std::process::exit(1);
            }
        }
    }
}

type Mismatches = Box<dyn Fn(&[u8]) -> usize>;

/// Deterministic inputs for the program, the output buffer to check and a
/// mismatch counter for its contents.
fn workload(program: &MeshProgram) -> (Vec<Vec<u8>>, &'static str, Mismatches) {
    match &program.plan {
        DesignPlan::MatVec(plan) => {
            let (m, k) = (plan.dims.rows, plan.dims.cols);
            let a: Vec<f32> = (0..m * k)
                .map(|i| ((i / k * 3 + i % k) % 7) as f32 - 3.0)
                .collect();
            let b: Vec<f32> = (0..k).map(|c| (c % 5) as f32 - 2.0).collect();
            let expected: Vec<f32> = (0..m)
                .map(|r| (0..k).map(|c| a[r * k + c] * b[c]).sum())
                .collect();
            let to_bytes = |v: &[f32]| -> Vec<u8> {
                v.iter().flat_map(|&x| f32_to_bf16(x).to_le_bytes()).collect()
            };
            let count: Mismatches = Box::new(move |out: &[u8]| {
                let words = out
                    .chunks_exact(4)
                    .map(|w| f32::from_le_bytes([w[0], w[1], w[2], w[3]]));
                let wrong = words.zip(&expected).filter(|(got, want)| got != *want).count();
                wrong + expected.len().saturating_sub(out.len() / 4)
            });
            (vec![to_bytes(&a), to_bytes(&b)], "C", count)
        }
        DesignPlan::Stream(plan) => {
            let input: Vec<u8> = (0..plan.dims.length).map(|i| (i % 251) as u8).collect();
            let expected = input.clone();
            let count: Mismatches = Box::new(move |out: &[u8]| {
                let wrong = out.iter().zip(&expected).filter(|(o, i)| o != i).count();
                wrong + expected.len().saturating_sub(out.len())
            });
            (vec![input], "out", count)
        }
    }
}

/// Run the loaded program `iterations` times, checking every output.
/// Returns whether all runs passed.
fn simulate(program: &MeshProgram, iterations: usize, verbose: bool) -> CompileResult<bool> {
    let kernels = KernelRegistry::reference();
    let (inputs, output, mismatches) = workload(program);
    let views: Vec<&[u8]> = inputs.iter().map(Vec::as_slice).collect();
    let session = MeshRuntime::new(program, &kernels).run_repeated(&views, iterations)?;

    let mut passed = true;
    for (n, invocation) in session.invocations.iter().enumerate() {
        if verbose {
            println!("run {}: time is {} us", n, invocation.elapsed.as_micros());
        }
        match mismatches(invocation.buffer(program, output).unwrap_or_default()) {
            0 => println!("{}", "PASS!".bold().green()),
            errors => {
                println!("{} {} mismatches", "FAIL:".bold().red(), errors);
                passed = false;
            }
        }
    }

    if iterations > 1 {
        let timed = if iterations > WARMUP_RUNS {
            &session.invocations[WARMUP_RUNS..]
        } else {
            &session.invocations[..]
        };
        let total: Duration = timed.iter().map(|i| i.elapsed).sum();
        let mean = total / timed.len().max(1) as u32;
        // every input is loaded and every output written once per run
        let moved: usize = program.buffers.iter().map(|b| b.bytes()).sum();
        println!("average time is {} us", mean.as_micros());
        if mean > Duration::ZERO {
            println!(
                "load and write bandwidth is {:.3} GB/s",
                moved as f64 / mean.as_secs_f64() / 1e9
            );
        }
    }
    Ok(passed)
}

fn print_program(program: &MeshProgram, verbose: bool) {
    println!("{}", "Mapping Results".bold().green());
    println!("{}", "=".repeat(50));
    println!();
    print!("{}", program.summary);
    println!();

    println!("{}", "Channels".bold().yellow());
    println!("{}", "-".repeat(50));
    for channel in program.network.channels() {
        let pattern = match &channel.access_pattern {
            Some(p) => format!(" pattern {:?}", p.levels),
            None => String::new(),
        };
        println!(
            "  {} {} -> {} x{} {}{}",
            channel.name.cyan(),
            channel.producers.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(","),
            channel.consumers.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(","),
            channel.depth,
            channel.shape,
            pattern
        );
    }
    println!();

    if verbose || program.sequence.descriptors.len() <= 16 {
        println!("{}", "Transfer Descriptors".bold().yellow());
        println!("{}", "-".repeat(50));
        for (i, desc) in program.sequence.descriptors.iter().enumerate() {
            println!(
                "  {} {} on {} slot {}: offsets {:?} sizes {:?} strides {:?}",
                format!("#{}", i).bold(),
                desc.channel_name.cyan(),
                desc.interface,
                desc.slot,
                desc.offsets,
                desc.sizes,
                desc.strides
            );
        }
        for barrier in &program.sequence.barriers {
            println!(
                "  {} {} {:?}",
                "await".bold(),
                barrier.group.interface,
                barrier.group.direction
            );
        }
    } else {
        println!(
            "({} descriptors, use -v for details)",
            program.sequence.descriptors.len()
        );
    }
}
