pub mod audit;
pub mod checks;
pub mod library_ops;
pub mod selection_aggregate;
pub mod selection_ops;
pub mod versioned;

pub use audit::*;
pub use checks::*;
pub use library_ops::*;
pub use selection_aggregate::*;
pub use selection_ops::*;
pub use versioned::*;
