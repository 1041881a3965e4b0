pub mod error;
pub mod mac;

pub use error::{CoffreError, Result};
pub use mac::Mac;
