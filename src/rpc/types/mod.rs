mod core;
mod tools;

pub use self::core::*;
pub use self::tools::*;
