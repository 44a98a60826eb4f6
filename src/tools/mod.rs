//! 工具层：UI 能力集、应用目录与动作执行器

pub mod apps;
pub mod capability;
pub mod executor;

pub use apps::AppCatalog;
pub use capability::{SurfaceCapabilities, UiCapabilities};
pub use executor::{ActionExecutor, ActionOutcome, ExecutorSettings};
