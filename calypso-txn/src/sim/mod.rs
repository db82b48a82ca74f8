//! Card simulation
//!
//! A virtual Calypso card and a reader driving it, for running transactions
//! without hardware.

mod card;
mod reader;

pub use card::{VirtualCalypsoCard, DF_NAME, SERIAL_NUMBER};
pub use reader::VirtualCardReader;
