//! HTTP plumbing: the fetch/probe seams, the reqwest transport with per-proxy
//! client caching, the failure taxonomy, and the static stage pipeline.

pub mod client;
pub mod failure;
pub mod options;
pub mod stages;

pub use client::{Fetcher, HttpFetcher, Prober};
pub use failure::FetchFailure;
pub use options::FetchClientOptions;
pub use stages::{
    FetchResponse, FetchStage, FingerprintStage, PreparedRequest, StageContext, StagePipeline,
    StagePipelineBuilder, TraceStage,
};
