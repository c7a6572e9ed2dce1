//! Pure string/JSON helpers used by the step and instance executors.
//!
//! Everything in here works on a caller-owned [`Context`] and never touches
//! the network or any shared state.

use std::collections::HashMap;

pub mod extract;
pub mod resolve;
pub mod transform;

pub use extract::{UNKNOWN_VALUE, extract_path, extract_rules, parse_body};
pub use resolve::resolve_template;
pub use transform::apply_transforms;

/// The variables visible to one target execution.
pub type Context = HashMap<String, String>;
