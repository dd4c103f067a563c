pub mod driver;

pub use driver::{CannedStatement, CannedValue, MemoryDriver};
