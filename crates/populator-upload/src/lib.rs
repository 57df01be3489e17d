//! Resource ordering and upload for the FHIR populator.
//!
//! This crate provides:
//! - Reading FHIR resource files (JSON and XML) from extracted packages
//! - The fixed resource-type priority table and per-package ordering
//! - Identifier assignment policies (generated and versioned ids)
//! - The sequential upload state machine with a pluggable recovery protocol

mod orchestrator;
mod plan;
mod resource;
mod store;

pub use orchestrator::{
    AbortReason, RecoveryChoice, RecoveryDecider, RunReport, ScriptedDecider, SkippedUnit,
    UnitState, Uploader,
};
pub use plan::{build_plan, Method, PackageResources, PlanOptions, TypeFilter, UploadUnit};
pub use resource::{
    scan_package, ResourceError, ResourceFile, ResourceFormat, DEFAULT_TYPE_RANK,
};
pub use store::{FhirStore, HttpStore, Rejection};
