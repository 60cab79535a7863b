//! The closed set of pipeline kinds and the name-keyed catalog that selects them.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use storycrew_shared::{Result, StoryCrewError};

use crate::pipeline::StageRole;

/// A registered pipeline variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// Story analysis and knowledge-graph construction.
    Architect,
    /// Scene breakdown and shot lists.
    Director,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 2] = [Self::Architect, Self::Director];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Architect => "architect",
            Self::Director => "director",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Architect => "Parse a story and build its knowledge graph",
            Self::Director => "Break scenes down into analyzed shots and shot lists",
        }
    }

    /// Stage roles, in execution order.
    pub fn stages(&self) -> &'static [StageRole] {
        match self {
            Self::Architect => &[StageRole::StoryParser, StageRole::GraphBuilder],
            Self::Director => &[StageRole::SceneAnalyzer, StageRole::ShotGenerator],
        }
    }

    /// Pipeline a caller should run after this one.
    pub fn next_phase(&self) -> &'static str {
        match self {
            Self::Architect => "director",
            Self::Director => "specialists",
        }
    }

    /// Workflow step recorded on the project once the pipeline completes.
    pub fn completion_step(&self) -> &'static str {
        match self {
            Self::Architect => "story_analysis_complete",
            Self::Director => "scene_breakdown_complete",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name-keyed registry of the pipelines a dispatcher will accept.
#[derive(Debug, Clone)]
pub struct PipelineCatalog {
    kinds: BTreeMap<&'static str, PipelineKind>,
}

impl Default for PipelineCatalog {
    fn default() -> Self {
        Self::with_kinds(PipelineKind::ALL)
    }
}

impl PipelineCatalog {
    /// A catalog accepting only `kinds`.
    pub fn with_kinds(kinds: impl IntoIterator<Item = PipelineKind>) -> Self {
        Self {
            kinds: kinds.into_iter().map(|k| (k.as_str(), k)).collect(),
        }
    }

    /// Look up a pipeline by name.
    pub fn get(&self, name: &str) -> Result<PipelineKind> {
        self.kinds
            .get(name)
            .copied()
            .ok_or_else(|| StoryCrewError::UnknownPipeline(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.kinds.keys().copied().collect()
    }

    pub fn kinds(&self) -> impl Iterator<Item = PipelineKind> + '_ {
        self.kinds.values().copied()
    }
}
