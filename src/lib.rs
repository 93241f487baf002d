//! Lectern: a classroom WebSocket relay pairing one teacher with many students per room.

pub mod relay;
