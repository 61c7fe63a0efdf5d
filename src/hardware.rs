//! Hardware description of the tile mesh
//!
//! The mesh is a grid of columns. Each column stacks three tiers: a
//! host-facing interface tile, an on-chip stage (memory) tile and a number of
//! compute tiles. Which row belongs to which tier is configuration, not code.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};

/// Width of one host transfer word in bytes. Host buffers and transfer
/// descriptors are measured in these words.
pub const TRANSFER_WORD_BYTES: usize = 4;

/// Configuration for the mesh hardware
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Number of columns in the mesh
    pub columns: usize,
    /// Number of rows in the mesh, all tiers included
    pub rows: usize,
    /// Row holding the interface tiles
    pub interface_row: usize,
    /// Row holding the stage tiles
    pub stage_row: usize,
    /// First compute row; every row from here to `rows` is compute
    pub first_compute_row: usize,
    /// Local memory of a compute tile in bytes
    pub compute_memory_bytes: usize,
    /// Local memory of a stage tile in bytes
    pub stage_memory_bytes: usize,
    /// Buffer-descriptor slots available on each interface tile
    pub interface_bd_slots: usize,
    /// Depth used for every channel
    pub channel_depth: usize,
}

impl MeshConfig {
    /// The four-column NPU layout: row 0 interface, row 1 stage, rows 2..6 compute.
    pub fn npu_4col() -> Self {
        Self {
            columns: 4,
            rows: 6,
            interface_row: 0,
            stage_row: 1,
            first_compute_row: 2,
            compute_memory_bytes: 64 * 1024,
            stage_memory_bytes: 512 * 1024,
            interface_bd_slots: 16,
            channel_depth: 2,
        }
    }

    /// Number of compute rows available in each column
    pub fn compute_rows(&self) -> usize {
        self.rows.saturating_sub(self.first_compute_row)
    }

    /// Tier of a given row, if the row exists.
    pub fn tier_of(&self, row: usize) -> Option<Tier> {
        if row >= self.rows {
            None
        } else if row == self.interface_row {
            Some(Tier::Interface)
        } else if row == self.stage_row {
            Some(Tier::Stage)
        } else if row >= self.first_compute_row {
            Some(Tier::Compute)
        } else {
            None
        }
    }

    /// Local memory capacity of a tier; interface tiles are not bounded here.
    pub fn capacity_of(&self, tier: Tier) -> Option<usize> {
        match tier {
            Tier::Interface => None,
            Tier::Stage => Some(self.stage_memory_bytes),
            Tier::Compute => Some(self.compute_memory_bytes),
        }
    }

    /// Check the configuration itself before anything is built on it.
    pub fn validate(&self) -> CompileResult<()> {
        if self.columns == 0 || self.rows == 0 {
            return Err(CompileError::topology("mesh must have at least one column and row"));
        }
        if self.interface_row == self.stage_row
            || self.first_compute_row <= self.interface_row
            || self.first_compute_row <= self.stage_row
        {
            return Err(CompileError::topology(format!(
                "invalid tier rows: interface {}, stage {}, first compute {}",
                self.interface_row, self.stage_row, self.first_compute_row
            )));
        }
        if self.compute_rows() == 0 {
            return Err(CompileError::topology("mesh has no compute rows"));
        }
        if self.channel_depth < 2 {
            return Err(CompileError::topology(format!(
                "channel depth {} is below double buffering",
                self.channel_depth
            )));
        }
        if self.interface_bd_slots == 0 {
            return Err(CompileError::topology("interface tiles need at least one descriptor slot"));
        }
        Ok(())
    }

    /// Load a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::npu_4col()
    }
}

/// Role layer of a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    /// Host-facing transfer tile
    Interface,
    /// On-chip staging tile
    Stage,
    /// Kernel execution tile
    Compute,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Interface => "interface",
            Tier::Stage => "stage",
            Tier::Compute => "compute",
        };
        f.write_str(name)
    }
}

/// Position of a tile in the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub column: usize,
    pub row: usize,
}

impl TileCoord {
    pub fn new(column: usize, row: usize) -> Self {
        Self { column, row }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.column, self.row)
    }
}

/// A tile of the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tile {
    pub coord: TileCoord,
    pub tier: Tier,
    /// Local memory in bytes, `None` for interface tiles
    pub capacity: Option<usize>,
}

/// Element type carried by a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Bf16,
    F32,
    U8,
    I32,
}

impl ElementType {
    pub fn bytes(self) -> usize {
        match self {
            ElementType::Bf16 => 2,
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::U8 => 1,
        }
    }

    /// Convert an element count to transfer words, failing when the byte
    /// count does not fill a whole number of words.
    pub fn to_words(self, elements: usize) -> CompileResult<usize> {
        let bytes = elements.checked_mul(self.bytes()).ok_or_else(|| {
            CompileError::tiling(format!(
                "{} {:?} elements overflow the byte count",
                elements, self
            ))
        })?;
        if bytes % TRANSFER_WORD_BYTES != 0 {
            return Err(CompileError::tiling(format!(
                "{} {:?} elements ({} bytes) are not a whole number of {}-byte words",
                elements, self, bytes, TRANSFER_WORD_BYTES
            )));
        }
        Ok(bytes / TRANSFER_WORD_BYTES)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::Bf16 => "bf16",
            ElementType::F32 => "f32",
            ElementType::U8 => "u8",
            ElementType::I32 => "i32",
        };
        f.write_str(name)
    }
}

/// Shape of one channel slot or kernel buffer argument
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BufferShape {
    pub dims: Vec<usize>,
    pub element: ElementType,
}

impl BufferShape {
    pub fn vector(len: usize, element: ElementType) -> Self {
        Self { dims: vec![len], element }
    }

    pub fn matrix(rows: usize, cols: usize, element: ElementType) -> Self {
        Self { dims: vec![rows, cols], element }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.len() * self.element.bytes()
    }

    /// Same element type and element count, ignoring how the dims are split.
    pub fn same_footprint(&self, other: &BufferShape) -> bool {
        self.element == other.element && self.len() == other.len()
    }
}

impl fmt::Display for BufferShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        write!(f, "[{}] {}", dims.join("x"), self.element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tier_rule() {
        let config = MeshConfig::npu_4col();
        assert_eq!(config.tier_of(0), Some(Tier::Interface));
        assert_eq!(config.tier_of(1), Some(Tier::Stage));
        assert_eq!(config.tier_of(2), Some(Tier::Compute));
        assert_eq!(config.tier_of(5), Some(Tier::Compute));
        assert_eq!(config.tier_of(6), None);
        assert_eq!(config.compute_rows(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_shallow_depth_rejected() {
        let config = MeshConfig {
            channel_depth: 1,
            ..MeshConfig::npu_4col()
        };
        assert!(matches!(
            config.validate(),
            Err(CompileError::TopologyError { .. })
        ));
    }

    #[test]
    fn test_word_conversion() {
        assert_eq!(ElementType::Bf16.to_words(64), Ok(32));
        assert_eq!(ElementType::F32.to_words(3), Ok(3));
        assert!(ElementType::Bf16.to_words(3).is_err());
        assert!(ElementType::U8.to_words(6).is_err());
    }

    #[test]
    fn test_config_json() {
        let config = MeshConfig::npu_4col();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(MeshConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_shape_footprint() {
        let a = BufferShape::matrix(4, 8, ElementType::Bf16);
        let b = BufferShape::vector(32, ElementType::Bf16);
        assert!(a.same_footprint(&b));
        assert_eq!(a.bytes(), 64);
        assert_eq!(a.to_string(), "[4x8] bf16");
    }
}
