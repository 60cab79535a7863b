//! Stage workers: the capability-tagged units a pipeline runs in order.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every stage role known to the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    StoryParser,
    GraphBuilder,
    SceneAnalyzer,
    ShotGenerator,
}

impl StageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StoryParser => "story_parser",
            Self::GraphBuilder => "graph_builder",
            Self::SceneAnalyzer => "scene_analyzer",
            Self::ShotGenerator => "shot_generator",
        }
    }

    /// Persona presented to the executor.
    pub fn title(&self) -> &'static str {
        match self {
            Self::StoryParser => "Story Structure Analyst",
            Self::GraphBuilder => "Knowledge Graph Architect",
            Self::SceneAnalyzer => "Scene Analysis Director",
            Self::ShotGenerator => "Cinematography Specialist",
        }
    }

    pub fn goal(&self) -> &'static str {
        match self {
            Self::StoryParser => {
                "Parse and analyze story text to identify scenes, characters, locations, \
                 and narrative elements with precision"
            }
            Self::GraphBuilder => {
                "Create structured graph relationships between story elements for \
                 knowledge-graph storage"
            }
            Self::SceneAnalyzer => {
                "Analyze story scenes and break them down into detailed shot sequences \
                 with cinematic precision"
            }
            Self::ShotGenerator => {
                "Generate detailed shot lists with camera specifications, lighting, and \
                 technical requirements"
            }
        }
    }

    /// Work order for this stage.
    pub fn task(&self) -> &'static str {
        match self {
            Self::StoryParser => {
                "Analyze the story text and extract scene boundaries, characters with roles \
                 and relationships, locations with atmosphere, key objects, emotional beats, \
                 dialogue and themes. Answer with a JSON object containing `entities` and \
                 `relationships` arrays followed by a short narrative summary."
            }
            Self::GraphBuilder => {
                "Using the parsed story elements, define the entities and semantic \
                 relationships of the story knowledge graph, validate that every \
                 relationship connects known entities, and report entity and relationship \
                 counts."
            }
            Self::SceneAnalyzer => {
                "Break down each scene from the story graph: character blocking, emotional \
                 beats, visual requirements, pacing, transitions, mood and technical \
                 considerations, with recommended shot approaches."
            }
            Self::ShotGenerator => {
                "Create a shot list for each analyzed scene with camera angle, movement and \
                 lens, lighting setup, audio needs, continuity notes, production notes and \
                 estimated shooting time, respecting the production constraints."
            }
        }
    }

    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            Self::StoryParser => &[Capability::Content],
            Self::GraphBuilder | Self::SceneAnalyzer | Self::ShotGenerator => {
                &[Capability::KnowledgeGraph, Capability::Content]
            }
        }
    }
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External collaborators a stage may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    KnowledgeGraph,
    Content,
}

/// One configured stage of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageWorker {
    pub role: StageRole,
    pub goal: &'static str,
    pub capabilities: &'static [Capability],
}

impl StageWorker {
    pub fn new(role: StageRole) -> Self {
        Self {
            role,
            goal: role.goal(),
            capabilities: role.capabilities(),
        }
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// What a stage produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub role: StageRole,
    pub text: String,
    /// Side-effect receipts and tool results, e.g. a saved graph ID.
    pub artifacts: Value,
}
