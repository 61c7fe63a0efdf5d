use proptest::prelude::*;

use tile_mesh_mapper::descriptor::check_coverage;
use tile_mesh_mapper::{
    compile_matvec, compile_stream, Direction, ElementType, MatVecDesign, MeshConfig, MeshProgram,
    ProblemDims, StreamDims, TilingPlanner,
};

/// Divisible matrix-vector shapes that fit the default mesh.
fn matvec_dims() -> impl Strategy<Value = ProblemDims> {
    (
        prop::sample::select(vec![16usize, 32, 64]),
        prop::sample::select(vec![16usize, 32, 64]),
        prop::sample::select(vec![1usize, 2, 4]),
        1usize..=4,
        1usize..=3,
        1usize..=4,
    )
        .prop_map(|(m, k, n_cols, cpc, rbpc, kb)| {
            let n_cores = n_cols * cpc;
            ProblemDims::new(m * n_cores * rbpc, k * kb, m, k, n_cores, n_cols)
        })
}

fn stream_dims() -> impl Strategy<Value = StreamDims> {
    (
        prop::sample::select(vec![1usize, 2, 4]),
        1usize..=3,
        prop::sample::select(vec![32usize, 64, 128]),
        1usize..=4,
    )
        .prop_map(|(n_cols, cpc, line_len, lines)| StreamDims {
            length: n_cols * cpc * line_len * lines,
            element: ElementType::U8,
            n_cols,
            cores_per_column: cpc,
            line_len,
        })
}

fn assert_descriptor_invariants(program: &MeshProgram) {
    let descs = &program.sequence.descriptors;
    for buffer in &program.buffers {
        let own: Vec<_> = descs.iter().filter(|d| d.buffer == buffer.id).cloned().collect();
        check_coverage(buffer, &own).unwrap();
    }
    for desc in descs {
        let channel = program.network.get(desc.channel).unwrap();
        assert_eq!(desc.byte_count() % channel.slot_bytes(), 0);
    }
    for channel in program.network.channels() {
        assert!(channel.depth >= 2);
    }
}

proptest! {
    #[test]
    fn tiling_partitions_rows(dims in matvec_dims()) {
        let plan = TilingPlanner::new(dims).plan().unwrap();
        let mut rows: Vec<usize> = Vec::new();
        for column in 0..dims.n_cols {
            for core in 0..plan.cores_per_column {
                for range in plan.core_rows(column, core) {
                    rows.extend(range);
                }
            }
        }
        rows.sort_unstable();
        prop_assert_eq!(rows, (0..dims.rows).collect::<Vec<_>>());
        prop_assert_eq!(plan.rows_per_column() * dims.n_cols, dims.rows);
        let blocks: usize = plan.columns.iter().map(|c| c.row_blocks).sum();
        prop_assert_eq!(blocks, dims.rows / dims.block_rows);
    }

    #[test]
    fn matvec_descriptors_cover_buffers(dims in matvec_dims()) {
        let program = compile_matvec(&MatVecDesign::new(dims), &MeshConfig::npu_4col()).unwrap();
        assert_descriptor_invariants(&program);

        let cpc = dims.n_cores / dims.n_cols;
        for link in program.network.links() {
            prop_assert_eq!(program.network.link_endpoints(link), cpc);
        }
        prop_assert_eq!(program.tasks.len(), dims.n_cores);
    }

    #[test]
    fn stream_moves_every_byte_once(dims in stream_dims()) {
        let program = compile_stream(&dims, &MeshConfig::npu_4col()).unwrap();
        assert_descriptor_invariants(&program);

        let bytes = |direction| -> usize {
            program
                .sequence
                .descriptors
                .iter()
                .filter(|d| d.direction == direction)
                .map(|d| d.byte_count())
                .sum()
        };
        prop_assert_eq!(bytes(Direction::HostToDevice), dims.length);
        prop_assert_eq!(bytes(Direction::DeviceToHost), dims.length);
    }
}
