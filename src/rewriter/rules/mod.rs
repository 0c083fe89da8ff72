//! The individual rewrite rules, one syntactic category each.

mod functions;
mod merge;
mod params;
mod pragmas;
mod table_refs;
mod target_dml;
mod temp_tables;
mod validation;

pub use functions::FunctionRule;
pub use merge::MergeSourceRule;
pub use params::{OptionalParamRule, RequiredParamRule};
pub use pragmas::PragmaRule;
pub use table_refs::TableRefRule;
pub use target_dml::TargetDmlRule;
pub use temp_tables::TempTableRule;
pub use validation::ValidationRule;
