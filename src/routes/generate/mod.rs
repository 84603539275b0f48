mod handler;
mod model;

pub use handler::{GENERATE_OPERATION, generate};
pub use model::GenerateResult;
