pub mod failure;
pub mod utils;

pub use failure::{Disposition, JobError};
