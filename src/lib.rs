pub mod apps;
pub mod config;
pub mod executor;
pub mod expression;
pub mod fetch;
pub mod logger;
pub mod scheduler;
pub mod schema;
pub mod settings;
pub mod sink;
pub mod sync;
pub mod template;
pub mod template_commands;
pub mod watcher;
