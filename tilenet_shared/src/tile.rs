//! Tiles and layers.

use serde::{Deserialize, Serialize};

/// Opaque content identifier for one cell. `0` is empty space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Tile(pub u16);

impl Tile {
    pub const EMPTY: Tile = Tile(0);

    pub fn is_empty(self) -> bool {
        self == Tile::EMPTY
    }
}

/// One of the parallel grids of a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Layer {
    Foreground = 0,
    Background = 1,
}

impl Layer {
    /// Known layers, in stream order.
    pub const ALL: [Layer; 2] = [Layer::Foreground, Layer::Background];

    pub const COUNT: usize = Self::ALL.len();

    pub fn from_index(v: i32) -> Option<Self> {
        match v {
            0 => Some(Layer::Foreground),
            1 => Some(Layer::Background),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}
