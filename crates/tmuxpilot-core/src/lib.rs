pub mod domain;
pub mod error;
pub mod ring_buffer;
pub mod ticket;
pub mod transcript;
pub mod waiting;

pub use domain::*;
pub use error::{TicketError, TranscriptError};
pub use ring_buffer::RingBuffer;
