//! Example: Stream Pass-Through
//!
//! Copies a u8 vector through one compute tile per column, then through two
//! compute tiles per column via the stage tiles, and compares the results.
//!
//! Run with: cargo run --example stream_passthrough

use tile_mesh_mapper::{
    compile_stream, execute, ElementType, KernelRegistry, MeshConfig, StreamDims,
};

fn main() {
    println!("=== Stream Pass-Through Example ===\n");

    let config = MeshConfig::npu_4col();
    let kernels = KernelRegistry::reference();
    let input: Vec<u8> = (0..4096).map(|i| (i % 256) as u8).collect();

    let mut outputs = Vec::new();
    for cores_per_column in [1, 2] {
        let dims = StreamDims {
            length: input.len(),
            element: ElementType::U8,
            n_cols: 4,
            cores_per_column,
            line_len: 64,
        };
        let program = compile_stream(&dims, &config).unwrap();
        println!(
            "{} core(s) per column: {} channels, {} links, {} descriptors",
            cores_per_column,
            program.network.channels().len(),
            program.network.links().len(),
            program.sequence.descriptors.len()
        );

        let run = execute(&program, &kernels, &[&input]).unwrap();
        outputs.push(run.buffer(&program, "out").unwrap().to_vec());
    }

    println!();
    println!("Outputs identical: {}", outputs[0] == outputs[1]);
    println!("Output equals input: {}", outputs[0] == input);
}
