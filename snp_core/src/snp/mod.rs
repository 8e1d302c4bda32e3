//! SNP: the message/segmentation/reassembly layer (component 4).

pub mod message;
pub mod reassembly;
pub mod segment;

pub use message::{Message, SendFlags};
