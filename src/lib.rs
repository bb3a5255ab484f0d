//! A cycle-accurate, event-driven simulator of a tiled neural-network
//! accelerator: a global clock, a message-routing fabric between devices, a
//! pipelined off-chip memory, processing-element and tile state machines, a
//! bitmap memory allocator, and a per-tile input cache.

pub mod cache;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod memory;
pub mod message;
pub mod operator;
pub mod pe;
pub mod router;
pub mod system;
pub mod tile;
pub mod trace;

pub use clock::Clock;
pub use device::{Device, DeviceId};
pub use error::{MemoryError, RouterError, SimError, TileError};
pub use message::{BinaryOperator, DType, Message, MessageId, MessageKind, Operator};
pub use router::MessageRouter;
pub use system::{AcceleratorSystem, LayerReport};
