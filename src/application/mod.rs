pub mod handlers;
pub mod runtime;

pub use handlers::LogOnlyHandler;
pub use runtime::Conduit;
