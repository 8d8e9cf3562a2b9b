pub mod condition;
pub mod rule_spec;
pub mod table;
pub mod target;

pub use condition::*;
pub use rule_spec::*;
pub use table::*;
pub use target::*;
