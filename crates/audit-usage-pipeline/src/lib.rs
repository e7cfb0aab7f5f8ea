#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

mod aggregate;
mod correlator;
mod run;
mod sink;
mod source;

pub use aggregate::{resolve_query_text, AggregationEngine, ConsistencyError};
pub use correlator::{Correlator, CorrelatorCounters, IngestOutcome, QueryCollisions};
pub use run::{run_usage_extraction, run_with_store, RunReport};
pub use sink::{CollectingSink, JsonLinesSink, UsageSink};
pub use source::{load_known_resources, EventSource, JsonLinesSource, RateLimited, RateLimiter};
