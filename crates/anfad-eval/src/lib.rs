pub mod env;
pub mod error;
pub mod interp;
pub mod value;

// Re-export commonly used types
pub use env::{Env, Frame};
pub use error::EvalError;
pub use interp::Vm;
pub use value::Value;
