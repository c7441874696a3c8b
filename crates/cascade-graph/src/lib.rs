//! Immutable graph model for the cascade execution engine.
//!
//! A [`GraphDef`] is a DAG of node invocations connected by data dependencies
//! and ordering-only (no-data) dependencies. Graphs are assembled through
//! [`GraphBuilder`], which rejects cycles, unknown references, and type
//! mismatches at registration time; [`GraphDef::validate`] reports the first
//! remaining structural defect.

pub mod builder;
pub mod graph;
pub mod node;

pub use builder::GraphBuilder;
pub use graph::{DependencySource, GraphDef};
pub use node::{InputDef, NodeDef, OutputDef};
