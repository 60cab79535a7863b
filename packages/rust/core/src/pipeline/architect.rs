//! Architect pipeline: story parsing and knowledge-graph construction.

use serde_json::{Value, json};
use tracing::info;

use storycrew_shared::Result;

use super::{Pipeline, StageOutput, StageRole, StageWorker, embedded_json, input_or, or_empty};

pub(super) async fn preprocess(pipeline: &Pipeline, input: &Value) -> Value {
    let services = &pipeline.services;
    let (project, story) = tokio::join!(
        services.content.get_project_data(&pipeline.project_id),
        services.content.get_story_data(&pipeline.project_id),
    );
    let project = or_empty(project, "get_project_data");
    let story = or_empty(story, "get_story_data");

    let preferences = match input.get("preferences") {
        Some(prefs) if !prefs.is_null() => prefs.clone(),
        _ => or_empty(
            services.content.get_user_preferences(&pipeline.user_id).await,
            "get_user_preferences",
        ),
    };

    let stored_text = story
        .get("current_content")
        .cloned()
        .unwrap_or_else(|| json!(""));

    json!({
        "story_text": input_or(input, "story_text", stored_text),
        "project_id": pipeline.project_id,
        "user_id": pipeline.user_id,
        "user_preferences": preferences,
        "project_context": project,
        "story_context": story,
        "graph_config": {
            "enable_semantic_search": true,
            "include_emotional_analysis": true,
            "create_character_arcs": true,
            "map_thematic_elements": true,
        },
    })
}

pub(super) async fn before_stage(
    _pipeline: &Pipeline,
    _worker: &StageWorker,
    _prior: &[StageOutput],
) -> Result<Value> {
    Ok(json!({}))
}

/// The graph builder persists the parsed graph and records the step on the
/// project.
pub(super) async fn after_stage(
    pipeline: &Pipeline,
    worker: &StageWorker,
    prior: &[StageOutput],
    text: &str,
) -> Result<Value> {
    if worker.role != StageRole::GraphBuilder {
        return Ok(json!({}));
    }

    let parsed = prior
        .iter()
        .find(|o| o.role == StageRole::StoryParser)
        .map(|o| o.text.as_str())
        .unwrap_or_default();
    let mut graph = embedded_json(parsed).unwrap_or_else(|| json!({ "analysis": parsed }));
    if let Some(fields) = graph.as_object_mut() {
        fields.insert("validation".into(), json!(text));
    }

    let services = &pipeline.services;
    let receipt = services
        .knowledge_graph
        .save_graph(&pipeline.project_id, &graph)
        .await?;
    let counts = json!({
        "graphId": receipt.get("graph_id").cloned().unwrap_or(Value::Null),
        "entities": receipt.get("entities_created").cloned().unwrap_or(Value::Null),
        "relationships": receipt.get("relationships_created").cloned().unwrap_or(Value::Null),
        "degraded": receipt.get("degraded").and_then(Value::as_bool).unwrap_or(false),
    });
    info!(project_id = %pipeline.project_id, %counts, "knowledge graph saved");

    services
        .content
        .update_status(
            &pipeline.project_id,
            "knowledge_graph_complete",
            &json!({ "knowledgeGraph": counts }),
        )
        .await?;

    Ok(json!({ "graph_receipt": receipt }))
}

pub(super) fn recommendations() -> Value {
    json!({
        "proceed_to_scene_breakdown": true,
        "estimated_scenes": "TBD",
        "complexity_level": "medium",
    })
}
