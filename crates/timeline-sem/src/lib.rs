pub mod decode;
pub mod handlers;
pub mod modules;
pub mod registry;
pub mod runtime;

pub use decode::SemDecodeError;
pub use handlers::{register_core, CORE_MODULE};
pub use modules::{ModuleFn, ModuleRegistry};
pub use registry::{SemContext, SemHandler, SemOutcome, SemRegistry};
pub use runtime::SemRuntime;
