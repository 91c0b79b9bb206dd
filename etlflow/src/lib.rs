//! # Etlflow
//!
//! A batched, deduplicating extract/transform/load engine.
//!
//! A step pulls rows from one extract, runs them through transforms and
//! bulk-writes them with one or more loads. Etlflow provides:
//!
//! - **Node graphs**: per-step DAGs wired by content-hash identities
//! - **Repeat tracking**: inputs already processed by a step are skipped
//! - **Idempotent writes**: primary keys are content hashes of identifying fields
//! - **Batched pipeline**: bounded queues and a worker pool for transforms
//! - **Step scheduling**: cross-step dependency ordering with failure policies
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use etlflow::prelude::*;
//!
//! let extract = ExtractNode::builder("numbers")
//!     .outputs(["x"])
//!     .build(IterExtract::new("0..10", || (0..10).map(NodeOutput::scalar)))?;
//! let plus_one = TransformNode::builder("plus_one")
//!     .input("x", extract.output("x")?)
//!     .outputs(["y"])
//!     .build(|inputs| {
//!         let x = inputs.required("x")?.as_i64().unwrap_or_default();
//!         Ok(NodeOutput::scalar(x + 1))
//!     })?;
//! let entity = Arc::new(
//!     LoadEntity::builder("t")
//!         .identifying_attribute("x", AttrType::Integer)
//!         .attribute("y", AttrType::Integer)
//!         .build()?,
//! );
//! let load = LoadNode::builder("write_t", entity)
//!     .input("x", extract.output("x")?)
//!     .input("y", plus_one.output("y")?)
//!     .build()?;
//!
//! let step = EtlStep::builder("numbers").extract(extract).transform(plus_one).load(load).build()?;
//! let engine = Engine::connect(EtlModel::new().with_step(step)?, EngineConfig::from_env()?).await?;
//! let report = engine.run(&RunConfig::new()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod graph;
pub mod identity;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod repeats;
pub mod scheduler;
pub mod store;


/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancellationToken, StructuredTaskGroup};
    pub use crate::config::{EngineConfig, ExecutionMode, LogConfig, PipelineConfig, RunConfig};
    pub use crate::core::{NodeOutput, Row, RunStatus, StepRunStatus};
    pub use crate::engine::{Engine, StepExitCode};
    pub use crate::errors::{
        ContractErrorInfo, CycleDetectedError, EtlError, StoreError, TransformError, ValidationError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::graph::{
        Arg, AttrType, ComputationalNode, Dependency, EtlStep, ExtractNode, Extractor, IterExtract,
        LoadEntity, LoadNode, TransformInputs, TransformNode, WriteMode,
    };
    pub use crate::model::EtlModel;
    pub use crate::observability::{init_logging, SpanTimer};
    pub use crate::scheduler::{FailurePolicy, RunReport, StepReport};
    pub use crate::store::{MemoryMetadataStore, MemoryTargetStore, MetadataStore, TargetStore};

    #[cfg(feature = "postgres")]
    pub use crate::store::postgres::{PgMetadataStore, PgTargetStore, QueryExtract};
}
