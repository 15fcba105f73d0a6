//! The wire codec: a growable byte FIFO, transactional length-prefixed
//! packet framing, and the typed object (de)serialization rules.

pub mod buffer;
pub mod packet;
pub mod wire;

pub use buffer::Buffer;
pub use packet::{take_packet, PacketReader, PacketWriter};
