pub mod audit;
pub mod common;
pub mod concept;
pub mod endpoint_selection;
pub mod objective_selection;
pub mod selection;
pub mod user_context;
pub mod version;

pub use audit::*;
pub use common::*;
pub use concept::*;
pub use endpoint_selection::*;
pub use objective_selection::*;
pub use selection::*;
pub use user_context::*;
pub use version::*;
