pub mod codec;
pub mod discovery;
pub mod registry;
pub mod scan;
pub mod traits;
