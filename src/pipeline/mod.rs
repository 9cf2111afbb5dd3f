//! Assets, jobs and job execution
//!
//! An asset is one materializable step of the pipeline; a job is a named
//! selection of assets. Running a job materializes the selected assets in
//! dependency order and stops at the first failure.

pub mod steps;

use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

pub use steps::PipelineRunner;

use crate::config::ConfigError;
use crate::database::DatabaseError;
use crate::fetch::FetchError;
use crate::infra::InfraError;
use crate::load::LoadError;
use crate::tunnel::TunnelError;

/// Error type for pipeline runs
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Infra(#[from] InfraError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Unknown asset: {0}")]
    UnknownAsset(String),

    /// Asset dependencies form a cycle
    #[error("Dependency cycle at asset {0}")]
    Cycle(String),

    /// Async runtime could not be created
    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Asset {asset} failed: {source}")]
    AssetFailed {
        asset: AssetKey,
        #[source]
        source: Box<PipelineError>,
    },
}

/// Result type for pipeline runs
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Materializable steps of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKey {
    AzurePsqlServer,
    RawData,
    LoadedData,
    DbtProfiles,
    DbtModels,
}

impl AssetKey {
    pub const ALL: [AssetKey; 5] = [
        AssetKey::AzurePsqlServer,
        AssetKey::RawData,
        AssetKey::LoadedData,
        AssetKey::DbtProfiles,
        AssetKey::DbtModels,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AssetKey::AzurePsqlServer => "azure_psql_server",
            AssetKey::RawData => "raw_data",
            AssetKey::LoadedData => "loaded_data",
            AssetKey::DbtProfiles => "dbt_profiles",
            AssetKey::DbtModels => "dbt_models",
        }
    }

    /// Upstream assets
    pub fn deps(&self) -> &'static [AssetKey] {
        match self {
            AssetKey::AzurePsqlServer | AssetKey::RawData | AssetKey::DbtProfiles => &[],
            AssetKey::LoadedData => &[AssetKey::RawData],
            AssetKey::DbtModels => &[AssetKey::LoadedData, AssetKey::DbtProfiles],
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            AssetKey::AzurePsqlServer => "Provision the Azure PostgreSQL server with Terraform.",
            AssetKey::RawData => "Download the degustations CSV export.",
            AssetKey::LoadedData => "Load degustations.csv into PostgreSQL as a raw table.",
            AssetKey::DbtProfiles => "Generate dbt profiles.yml for the active provider.",
            AssetKey::DbtModels => "Build the dbt models.",
        }
    }
}

impl std::fmt::Display for AssetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AssetKey {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AssetKey::ALL
            .into_iter()
            .find(|a| a.name() == s.trim())
            .ok_or_else(|| PipelineError::UnknownAsset(s.to_string()))
    }
}

/// A named asset selection
#[derive(Debug, Clone, Copy)]
pub struct JobDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub selection: &'static [AssetKey],
}

const JOBS: &[JobDefinition] = &[
    JobDefinition {
        name: "provision_infra",
        description: "Terraform",
        selection: &[AssetKey::AzurePsqlServer],
    },
    JobDefinition {
        name: "get_raw_data",
        description: "Get input data",
        selection: &[AssetKey::RawData],
    },
    JobDefinition {
        name: "load_data_job",
        description: "Load data",
        selection: &[AssetKey::LoadedData],
    },
    JobDefinition {
        name: "dbt_profiles_job",
        description: "Configure dbt",
        selection: &[AssetKey::DbtProfiles],
    },
    JobDefinition {
        name: "dbt_build_job",
        description: "Build dbt models",
        selection: &[AssetKey::DbtModels],
    },
    JobDefinition {
        name: "full_pipeline",
        description: "Download, load, configure dbt and build",
        selection: &[
            AssetKey::RawData,
            AssetKey::LoadedData,
            AssetKey::DbtProfiles,
            AssetKey::DbtModels,
        ],
    },
];

/// All defined jobs
pub fn jobs() -> &'static [JobDefinition] {
    JOBS
}

pub fn find_job(name: &str) -> PipelineResult<&'static JobDefinition> {
    JOBS.iter()
        .find(|job| job.name == name)
        .ok_or_else(|| PipelineError::UnknownJob(name.to_string()))
}

/// Topological order of `selection`
///
/// Only edges between selected assets count; unselected dependencies are
/// assumed to be materialized already.
pub fn execution_order(selection: &[AssetKey]) -> PipelineResult<Vec<AssetKey>> {
    let mut graph = DiGraph::<AssetKey, ()>::new();
    let mut nodes = HashMap::new();

    for asset in AssetKey::ALL.iter().filter(|a| selection.contains(a)) {
        nodes.insert(*asset, graph.add_node(*asset));
    }
    for (asset, node) in &nodes {
        for dep in asset.deps() {
            if let Some(dep_node) = nodes.get(dep) {
                graph.add_edge(*dep_node, *node, ());
            }
        }
    }

    let order = toposort(&graph, None)
        .map_err(|cycle| PipelineError::Cycle(graph[cycle.node_id()].to_string()))?;
    Ok(order.into_iter().map(|idx| graph[idx]).collect())
}

/// Record of one materialized asset
#[derive(Debug, Clone, Serialize)]
pub struct Materialization {
    pub asset: AssetKey,
    pub detail: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Summary of one job run
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub run_id: Uuid,
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub materialized: Vec<Materialization>,
}

/// Materializes a single asset
///
/// Implemented by [`PipelineRunner`]; tests use recording fakes.
pub trait AssetRunner {
    /// Returns a short human-readable description of what was produced
    fn materialize(&mut self, asset: AssetKey) -> PipelineResult<String>;
}

/// Run every asset of `job` in dependency order
pub fn run_job(job: &JobDefinition, runner: &mut dyn AssetRunner) -> PipelineResult<JobReport> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let order = execution_order(job.selection)?;
    tracing::info!(
        "Run {} of job {}: {}",
        run_id,
        job.name,
        order
            .iter()
            .map(|a| a.name())
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    let mut materialized = Vec::with_capacity(order.len());
    for asset in order {
        let asset_started = Utc::now();
        tracing::info!("Materializing {}", asset);
        let detail = runner
            .materialize(asset)
            .map_err(|e| PipelineError::AssetFailed {
                asset,
                source: Box::new(e),
            })?;
        tracing::info!("{}: {}", asset, detail);
        materialized.push(Materialization {
            asset,
            detail,
            started_at: asset_started,
            finished_at: Utc::now(),
        });
    }

    Ok(JobReport {
        run_id,
        job: job.name.to_string(),
        started_at,
        finished_at: Utc::now(),
        materialized,
    })
}
