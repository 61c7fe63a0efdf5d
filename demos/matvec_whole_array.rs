//! Example: Matrix-Vector Product on the Whole Array
//!
//! Maps a 512x256 bf16 matrix-vector product onto 8 compute tiles in 4
//! columns, prints the generated descriptors and runs the simulator.
//!
//! Run with: cargo run --example matvec_whole_array

use tile_mesh_mapper::kernels::f32_to_bf16;
use tile_mesh_mapper::{
    compile_matvec, execute, KernelRegistry, MatVecDesign, MeshConfig, ProblemDims,
};

fn main() {
    println!("=== Whole-Array Matrix-Vector Example ===\n");

    let config = MeshConfig::npu_4col();

    // The default problem size of the original design does not tile
    println!("Example 1: M = K = 288, m = k = 64");
    let degenerate = ProblemDims::new(288, 288, 64, 64, 8, 4);
    match compile_matvec(&MatVecDesign::new(degenerate), &config) {
        Ok(_) => println!("unexpectedly compiled\n"),
        Err(e) => println!("rejected: {}\n", e),
    }

    println!("Example 2: M = 512, K = 256, m = 32, k = 64");
    let dims = ProblemDims::new(512, 256, 32, 64, 8, 4);
    let program = compile_matvec(&MatVecDesign::new(dims), &config).unwrap();
    println!("{}", program);

    for desc in &program.sequence.descriptors {
        println!(
            "  {:<6} sizes {:?} strides {:?} offset {}",
            desc.channel_name,
            desc.sizes,
            desc.strides,
            desc.base()
        );
    }
    println!();

    let a: Vec<f32> = (0..512 * 256).map(|i| ((i / 256 + i % 256) % 5) as f32 - 2.0).collect();
    let b: Vec<f32> = (0..256).map(|c| (c % 3) as f32).collect();
    let bytes = |v: &[f32]| -> Vec<u8> {
        v.iter().flat_map(|&x| f32_to_bf16(x).to_le_bytes()).collect()
    };

    let run = execute(&program, &KernelRegistry::reference(), &[&bytes(&a), &bytes(&b)]).unwrap();
    let out = run.buffer(&program, "C").unwrap();
    let errors = out
        .chunks_exact(4)
        .enumerate()
        .filter(|(r, w)| {
            let expected: f32 = (0..256).map(|c| a[r * 256 + c] * b[c]).sum();
            f32::from_le_bytes([w[0], w[1], w[2], w[3]]) != expected
        })
        .count();
    println!("Simulated {} tiles, {} barriers retired", run.reports.len(), run.retired.len());
    println!("Mismatches: {}", errors);
}
