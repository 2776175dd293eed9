pub mod argv;
pub mod catalog;
pub mod compiler;
pub mod identify;
pub mod operations;

pub use compiler::{CommandCompiler, CommandPreview, CompileError, CompiledCommand, EngineLimits};
pub use operations::{Operation, OperationParams};
