//! Search-index vocabulary: typed index rows, extraction rules and their
//! lifecycle, and the parameter-set fingerprint.

mod extract;
mod params;
mod value;

pub use extract::{JsonIndexer, SearchIndexer};
pub use params::{
    param_set_hash, SearchParamInfo, SearchParamKind, SearchParamRegistry, SearchParamStatus,
    SupportResolver,
};
pub use value::{IndexRow, IndexValue};
