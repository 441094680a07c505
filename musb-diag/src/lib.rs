#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![deny(unsafe_code)]

mod controller;
mod error;
pub mod io;
pub mod registers;
pub mod regmap;
pub mod sequence;
pub mod setup;
pub mod surface;
pub mod testmode;

pub use controller::{Controller, TestModeReport, TestModeStart};
pub use error::Error;
pub use regmap::{REGISTER_MAP, RegisterDescriptor, RegisterDump, RegisterWidth};
pub use sequence::{SequenceHandle, SequenceOutcome, SequenceTimings, StdDelay};
pub use setup::SetupPacket;
pub use testmode::{CommandBuffer, TestCommand};
