//! Director pipeline: scene analysis and shot-list generation.

use serde_json::{Value, json};

use storycrew_services::QueryOptions;
use storycrew_shared::Result;

use super::{Pipeline, StageOutput, StageRole, StageWorker, input_or, or_empty};

/// Results requested from the knowledge graph for story-wide queries.
const STORY_QUERY_TOP_K: u32 = 20;

pub(super) async fn preprocess(pipeline: &Pipeline, input: &Value) -> Value {
    let services = &pipeline.services;
    let query = format!(
        "Get all scenes and story structure for project {}",
        pipeline.project_id
    );
    let options = QueryOptions::hybrid(STORY_QUERY_TOP_K);
    let (project, story_graph) = tokio::join!(
        services.content.get_project_data(&pipeline.project_id),
        services
            .knowledge_graph
            .query_story(&pipeline.project_id, &query, &options),
    );

    json!({
        "project_id": pipeline.project_id,
        "user_id": pipeline.user_id,
        "project_context": or_empty(project, "get_project_data"),
        "story_graph": or_empty(story_graph, "query_story"),
        "scene_selection": input_or(input, "scene_selection", json!("all")),
        "director_preferences": input_or(input, "director_preferences", json!({
            "style": "cinematic",
            "pacing": "medium",
            "complexity": "moderate",
        })),
        "production_constraints": input_or(input, "production_constraints", json!({
            "budget": "medium",
            "crew_size": "small",
            "equipment": "standard",
            "timeline": "flexible",
        })),
    })
}

/// The scene analyzer works from a fresh scene query.
pub(super) async fn before_stage(
    pipeline: &Pipeline,
    worker: &StageWorker,
    _prior: &[StageOutput],
) -> Result<Value> {
    if worker.role != StageRole::SceneAnalyzer {
        return Ok(json!({}));
    }
    let query = format!(
        "Get all scenes for project {} with character and location details",
        pipeline.project_id
    );
    let scenes = pipeline
        .services
        .knowledge_graph
        .query_story(
            &pipeline.project_id,
            &query,
            &QueryOptions::hybrid(STORY_QUERY_TOP_K),
        )
        .await?;
    Ok(json!({ "scenes": scenes }))
}

/// The shot generator stores its shot list in the knowledge graph.
pub(super) async fn after_stage(
    pipeline: &Pipeline,
    worker: &StageWorker,
    prior: &[StageOutput],
    text: &str,
) -> Result<Value> {
    if worker.role != StageRole::ShotGenerator {
        return Ok(json!({}));
    }
    let scene_analysis = prior
        .iter()
        .find(|o| o.role == StageRole::SceneAnalyzer)
        .map(|o| o.text.as_str())
        .unwrap_or_default();
    let shots = json!({
        "kind": "shot_list",
        "scene_analysis": scene_analysis,
        "shot_list": text,
    });
    let receipt = pipeline
        .services
        .knowledge_graph
        .save_graph(&pipeline.project_id, &shots)
        .await?;
    Ok(json!({ "graph_receipt": receipt }))
}

pub(super) fn recommendations() -> Value {
    json!({
        "proceed_to_specialists": true,
        "estimated_shooting_days": "TBD",
        "crew_requirements": "standard",
    })
}

pub(super) fn deliverables() -> Value {
    json!({
        "scene_breakdowns": "completed",
        "shot_lists": "completed",
        "technical_specs": "completed",
        "production_notes": "completed",
    })
}
