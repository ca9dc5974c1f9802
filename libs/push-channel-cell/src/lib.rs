pub mod channel;
pub mod error;
pub mod transport;

pub use channel::*;
pub use error::*;
pub use transport::*;
