//! PassThru Driver
//!
//! J2534 style vehicle diagnostics passthrough over a serial translator.
//!
//! ```no_run
//! use std::time::Duration;
//! use passthru_driver::{DriverConfig, PassThruDriver};
//! use passthru_protocol::{ConnectFlags, PassThruMsg, ProtocolId};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DriverConfig::load(None)?;
//! passthru_driver::logging::init_logging(&config.logging)?;
//!
//! let driver = PassThruDriver::with_serial(config);
//! driver.open(None)?;
//! let ch = driver.connect(ProtocolId::J1850Vpw, ConnectFlags::empty(), 10_400)?;
//! let request = PassThruMsg::new(ProtocolId::J1850Vpw, vec![0x68, 0x6A, 0xF1, 0x01, 0x00])?;
//! driver.write_msgs(ch, &[request], Duration::from_millis(100))?;
//! let batch = driver.read_msgs(ch, 10, Duration::from_millis(500))?;
//! println!("{} message(s), status {:?}", batch.len(), batch.status());
//! driver.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod driver;
mod engine;
pub mod logging;
mod pump;
mod registry;
pub mod variant;

pub use config::{ConfigError, DriverConfig, IsoTpConfig, LoggingConfig, SerialConfig};
pub use driver::PassThruDriver;
pub use engine::{EngineConfig, PartialWrite, ProtocolEngine, ReadBatch, WriteError};
pub use registry::RegistryError;

pub use msg_filter::FilterKind;
pub use periodic_scheduler::PeriodicStats;
