pub mod error;
pub mod ids;
pub mod pool;
pub mod txn;

pub use error::{Error, Result};
pub use ids::*;
pub use pool::Store;
pub use txn::Transaction;
