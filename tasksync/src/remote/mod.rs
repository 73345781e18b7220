//! Remote store adapters.
//!
//! Both implementations speak the snake_case wire shape internally and convert
//! at the edge with [`protocol::to_wire`](crate::protocol::to_wire) and
//! [`protocol::from_wire`](crate::protocol::from_wire), so the engine only ever
//! sees canonical internal records.

pub mod memory;
pub mod rest;

pub use memory::MemoryRemote;
pub use rest::RestRemote;
