//! Search for the Basalt server: parameter catalog, query parsing, the
//! constraint compiler and include expansion, plus the catalog-driven
//! metadata indexer the store plugs in.

pub mod compiler;
pub mod error;
pub mod include;
pub mod indexer;
pub mod parser;
pub mod registry;
pub mod types;

pub use compiler::{
    CompiledSearch, Constraint, InvalidParam, MAX_RESULTS, MAX_SORT_KEYS, RangeMatcher,
    SearchCompiler, SearchMatches, SortKey, ValueMatcher,
};
pub use error::{SearchError, SearchResult};
pub use include::{IncludeContext, IncludeParam, IncludeResolver, ResolvedIncludes};
pub use indexer::RegistryIndexer;
pub use parser::{ParsedParam, ParsedQuery, ParsedValue, SearchModifier, SearchPrefix};
pub use registry::{ParamDef, SearchRegistry};
