//! Error taxonomy.
//!
//! Configuration and programming errors are fatal and are propagated as
//! typed `Result::Err` values (so tests can match on them precisely)
//! rather than raw panics; resource exhaustion is a distinguished return
//! the caller retries or propagates; queue-full back-pressure is never an
//! error at all. One `thiserror` enum per subsystem, each variant carrying
//! just the fields its `#[error(...)]` message needs.

use thiserror::Error;

use crate::device::DeviceId;
use crate::message::{MessageId, Operator};

/// Programming errors raised by a [`crate::router::MessageRouter`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("{0} is not registered on this router")]
    UnregisteredDevice(DeviceId),
}

/// Programming errors raised by [`crate::memory::Memory`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("address {addr:#x} is out of bounds (memory holds {num_cells} cells)")]
    OutOfBounds { addr: u64, num_cells: usize },
    #[error("read of uninitialized memory at {0:#x}")]
    UninitializedRead(u64),
}

/// Errors raised by [`crate::memory::allocator::BitmapAllocator`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("arena size must be a positive multiple of the grain")]
    InvalidArena,
    #[error("grain must be a power of two")]
    InvalidGrain,
    #[error("address {0} was never part of a live allocation")]
    NotAllocated(u64),
}

/// Errors raised by [`crate::memory::memory_map::MemoryMap`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryMapError {
    #[error("array is already mapped")]
    DoubleMap,
    #[error("array was never mapped into memory")]
    NotMapped,
    #[error("memory device is out of memory")]
    OutOfMemory,
}

/// Programming errors raised by [`crate::tile::Tile`] while driving a command.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TileError {
    #[error("response for ({message_id:?}, seq {seq_num}) does not match any outstanding request")]
    CorrelationMismatch { message_id: MessageId, seq_num: u32 },
    #[error("operator {0:?} is not valid on a TileCmd")]
    UnsupportedOperator(Operator),
}

/// Configuration errors raised while loading an accelerator YAML.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("num_tile_rows and num_tile_cols must both be at least 1")]
    EmptyGrid,
}

/// The union of every fatal error class the core can surface.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    #[error(transparent)]
    MemoryMap(#[from] MemoryMapError),
    #[error(transparent)]
    Tile(#[from] TileError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
