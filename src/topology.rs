//! Mesh topology: which tiles a design occupies
//!
//! Every used column contributes one interface tile, optionally one stage
//! tile, and `cores_per_column` compute tiles stacked upward from the first
//! compute row.

use serde::Serialize;

use crate::error::{CompileError, CompileResult};
use crate::hardware::{MeshConfig, Tier, Tile, TileCoord};

/// Tiles of one mesh column
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnTiles {
    pub column: usize,
    pub interface: Tile,
    pub stage: Option<Tile>,
    pub compute: Vec<Tile>,
}

/// The set of tiles used by a design
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyModel {
    pub config: MeshConfig,
    pub columns: Vec<ColumnTiles>,
}

impl TopologyModel {
    /// Lay out `n_cols` columns with `cores_per_column` compute tiles each.
    /// `with_stage` selects the three-tier layout.
    pub fn build(
        config: &MeshConfig,
        n_cols: usize,
        cores_per_column: usize,
        with_stage: bool,
    ) -> CompileResult<Self> {
        config.validate()?;
        if n_cols == 0 || n_cols > config.columns {
            return Err(CompileError::topology(format!(
                "design needs {} columns, mesh has {}",
                n_cols, config.columns
            )));
        }
        if cores_per_column == 0 || cores_per_column > config.compute_rows() {
            return Err(CompileError::topology(format!(
                "design needs {} compute tiles per column, mesh has {} compute rows",
                cores_per_column,
                config.compute_rows()
            )));
        }

        let tile = |column: usize, row: usize, tier: Tier| Tile {
            coord: TileCoord::new(column, row),
            tier,
            capacity: config.capacity_of(tier),
        };

        let columns = (0..n_cols)
            .map(|column| ColumnTiles {
                column,
                interface: tile(column, config.interface_row, Tier::Interface),
                stage: with_stage.then(|| tile(column, config.stage_row, Tier::Stage)),
                compute: (0..cores_per_column)
                    .map(|i| tile(column, config.first_compute_row + i, Tier::Compute))
                    .collect(),
            })
            .collect();

        Ok(Self {
            config: config.clone(),
            columns,
        })
    }

    pub fn column(&self, column: usize) -> CompileResult<&ColumnTiles> {
        self.columns
            .get(column)
            .ok_or_else(|| {
                CompileError::topology(format!("column {} is not part of the design", column))
            })
    }

    pub fn cores_per_column(&self) -> usize {
        self.columns.first().map(|c| c.compute.len()).unwrap_or(0)
    }

    pub fn has_stage(&self) -> bool {
        self.columns.iter().all(|c| c.stage.is_some())
    }

    /// All compute tiles, column by column.
    pub fn compute_tiles(&self) -> impl Iterator<Item = &Tile> {
        self.columns.iter().flat_map(|c| c.compute.iter())
    }

    /// Look up a tile of the design by coordinate.
    pub fn tile(&self, coord: TileCoord) -> Option<&Tile> {
        let column = self.columns.get(coord.column)?;
        std::iter::once(&column.interface)
            .chain(column.stage.iter())
            .chain(column.compute.iter())
            .find(|t| t.coord == coord)
    }

    pub fn tier_of(&self, coord: TileCoord) -> CompileResult<Tier> {
        self.tile(coord)
            .map(|t| t.tier)
            .ok_or_else(|| {
                CompileError::topology(format!("tile {} is not part of the design", coord))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_tier_layout() {
        let topo = TopologyModel::build(&MeshConfig::npu_4col(), 4, 2, true).unwrap();
        assert_eq!(topo.columns.len(), 4);
        assert_eq!(topo.cores_per_column(), 2);
        assert!(topo.has_stage());
        let col = topo.column(3).unwrap();
        assert_eq!(col.interface.coord, TileCoord::new(3, 0));
        assert_eq!(col.stage.unwrap().coord, TileCoord::new(3, 1));
        let rows: Vec<usize> = col.compute.iter().map(|t| t.coord.row).collect();
        assert_eq!(rows, vec![2, 3]);
        assert_eq!(topo.compute_tiles().count(), 8);
        assert_eq!(topo.tier_of(TileCoord::new(1, 3)), Ok(Tier::Compute));
    }

    #[test]
    fn test_two_tier_layout_has_no_stage() {
        let topo = TopologyModel::build(&MeshConfig::npu_4col(), 2, 1, false).unwrap();
        assert!(!topo.has_stage());
        assert!(topo.tile(TileCoord::new(0, 1)).is_none());
    }

    #[test]
    fn test_design_larger_than_mesh() {
        let config = MeshConfig::npu_4col();
        assert!(TopologyModel::build(&config, 5, 1, true).is_err());
        assert!(TopologyModel::build(&config, 4, 5, true).is_err());
    }
}
