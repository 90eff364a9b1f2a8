/// In-memory marketplace backend used by embedded mode, the dev daemon and tests.
pub mod market;

pub use market::{MemCaller, MemMarket};
