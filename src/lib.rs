pub mod board;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod region;
pub mod regmap;
pub mod session;
pub mod sink;

pub use config::{Architecture, HarnessConfig};
pub use engine::{Engine, RunExit, RunLimits};
pub use error::{Error, Result};
pub use region::SharedRegion;
pub use regmap::{AddressRange, RegisterDescriptor, RegisterMap, Role};
pub use session::{Session, SessionConfig, SessionState};
