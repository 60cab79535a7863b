//! Deterministic stand-in payloads served when a service is unreachable in
//! degraded mode.
//!
//! Every function here is a pure function of its arguments: no clock, no
//! randomness. Two calls with the same inputs return equal values.

use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Knowledge graph
// ---------------------------------------------------------------------------

pub fn graph_saved(project_id: &str, graph: &Value) -> Value {
    json!({
        "success": true,
        "graph_id": format!("fallback_graph_{project_id}"),
        "entities_created": array_len(graph, "entities"),
        "relationships_created": array_len(graph, "relationships"),
        "message": "Fallback: graph save skipped, service unavailable",
        "degraded": true,
    })
}

pub fn query_results(project_id: &str, query: &str) -> Value {
    json!({
        "success": true,
        "project_id": project_id,
        "query": query,
        "results": [{
            "entity": "fallback_entity",
            "type": "character",
            "relevance": 0.95,
            "context": format!("Fallback result for query: {query}"),
        }],
        "message": "Fallback: query served without knowledge graph",
        "degraded": true,
    })
}

// ---------------------------------------------------------------------------
// Content service
// ---------------------------------------------------------------------------

pub fn project(project_id: &str) -> Value {
    json!({
        "id": project_id,
        "name": "Fallback Project",
        "status": "in_progress",
        "workflow_status": {
            "current_step": "story_analysis",
            "completed_steps": ["initial_concept"],
            "next_step": "scene_breakdown",
        },
        "settings": {
            "genre": "thriller",
            "tone": "dark",
            "target_audience": "adult",
        },
        "degraded": true,
    })
}

pub fn story(project_id: &str) -> Value {
    json!({
        "project_id": project_id,
        "current_content": "Fallback story content. A detective confronts a hidden truth \
                            inside an abandoned theatre.",
        "metadata": {
            "word_count": 1500,
            "estimated_scenes": 5,
            "main_characters": ["Detective Sarah", "Mysterious Figure"],
            "primary_location": "Theatre",
        },
        "quality_metrics": {
            "structure_score": 8.5,
            "character_development": 7.8,
            "pacing": 8.2,
        },
        "degraded": true,
    })
}

pub fn status_updated(project_id: &str, step: &str) -> Value {
    json!({
        "id": project_id,
        "status": step,
        "success": true,
        "degraded": true,
    })
}

pub fn results_saved(project_id: &str, pipeline_type: &str) -> Value {
    json!({
        "id": format!("{pipeline_type}_{project_id}_result"),
        "project_id": project_id,
        "crew_type": pipeline_type,
        "success": true,
        "degraded": true,
    })
}

pub fn user_preferences(_user_id: &str) -> Value {
    json!({
        "default_genre": "thriller",
        "preferred_tone": "dark",
        "style_preference": "cinematic",
        "complexity_level": "medium",
        "ai_assistance_level": "high",
    })
}

fn array_len(value: &Value, key: &str) -> usize {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallbacks_are_deterministic() {
        let graph = json!({"entities": [1, 2, 3], "relationships": [1]});
        assert_eq!(graph_saved("p1", &graph), graph_saved("p1", &graph));
        assert_eq!(query_results("p1", "scenes"), query_results("p1", "scenes"));
        assert_eq!(project("p1"), project("p1"));
        assert_eq!(story("p1"), story("p1"));
        assert_eq!(status_updated("p1", "done"), status_updated("p1", "done"));
        assert_eq!(results_saved("p1", "architect"), results_saved("p1", "architect"));
        assert_eq!(user_preferences("u1"), user_preferences("u1"));
    }

    #[test]
    fn graph_counts_follow_input() {
        let graph = json!({"entities": [1, 2, 3], "relationships": [1]});
        let saved = graph_saved("p1", &graph);
        assert_eq!(saved["entities_created"], 3);
        assert_eq!(saved["relationships_created"], 1);
        assert_eq!(saved["graph_id"], "fallback_graph_p1");

        let empty = graph_saved("p1", &json!("not a graph"));
        assert_eq!(empty["entities_created"], 0);
    }

    #[test]
    fn payloads_are_marked_degraded() {
        assert_eq!(project("p9")["id"], "p9");
        assert_eq!(project("p9")["degraded"], true);
        assert_eq!(results_saved("p9", "director")["id"], "director_p9_result");
        assert!(
            query_results("p9", "who")["results"][0]["context"]
                .as_str()
                .unwrap()
                .contains("who")
        );
    }
}
