//! # procshift
//!
//! Rule-based conversion of T-SQL stored procedures into templated dbt
//! models for AWS Glue (Spark SQL), Athena (Trino SQL) and Redshift.
//!
//! ## Quick Example
//!
//! ```rust
//! use procshift::prelude::*;
//!
//! let text = "CREATE PROCEDURE dbo.usp_sales_report @region VARCHAR(10) = NULL AS
//! BEGIN
//!     SET NOCOUNT ON;
//!     SELECT customer_id, amount FROM dbo.orders WHERE region = @region;
//! END";
//!
//! let artifact = procshift::convert(text, "sales_report", "athena", &ConvertOptions::new())?;
//! assert_eq!(artifact.pattern, ConversionPattern::FullLoad);
//! assert!(artifact.text.contains("{{ ref('orders') }}"));
//! assert_eq!(artifact.score, 100);
//! # Ok::<(), ConvertError>(())
//! ```
//!
//! ## Pipeline
//!
//! | Stage      | Module         | Output                                 |
//! |------------|----------------|----------------------------------------|
//! | Parse      | [`source`]     | name, parameters, body                 |
//! | Classify   | [`classifier`] | [`ConversionPattern`](classifier::ConversionPattern) |
//! | Rewrite    | [`rewriter`]   | templated body plus a rewrite log      |
//! | Emit       | [`emitter`]    | model text with a `config(...)` header |
//! | Score      | [`scorer`]     | automation score, 0 to 100             |
//!
//! [`project`] turns a batch of artifacts into dbt project files.

pub mod classifier;
pub mod config;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod lexer;
pub mod platform;
pub mod project;
pub mod rewriter;
pub mod scorer;
pub mod source;

pub mod prelude {
    pub use crate::classifier::{ConversionPattern, classify};
    pub use crate::engine::{ConversionArtifact, ConvertOptions, Converter};
    pub use crate::error::*;
    pub use crate::platform::{Platform, PlatformProfile, ProfileRegistry};
    pub use crate::project::{ProjectFile, ProjectSettings, scaffold};
    pub use crate::source::{Parameter, SourceUnit};
}

pub use engine::convert;
