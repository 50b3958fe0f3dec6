use serde_json::Value;

/// A ComfyUI-style node graph is a JSON object keyed by node id, each value
/// an object with `class_type` and an `inputs` map.
pub type Workflow = serde_json::Map<String, Value>;

const IMAGE_NODE_CLASS: &str = "LoadImage";
const VIDEO_NODE_CLASSES: [&str; 3] = ["LoadVideo", "VHS_LoadVideo", "LoadVideoPath"];
const DEFAULT_IMAGE_NODE_ID: &str = "10";
const DEFAULT_VIDEO_NODE_ID: &str = "2";

fn looks_like_image_ref(s: &str) -> bool {
    s.ends_with(".png") || s.ends_with(".jpg") || s.contains("pasted/") || s.contains("input")
}

/// Rewrite every `LoadImage` node's string/array inputs that look like an
/// image reference, and ensure an `image` key exists. Used for full-graph
/// preload warm-up, where every image input in the workflow must resolve
/// to the placeholder.
pub fn rewrite_image_preload(workflow: &Workflow, placeholder_name: &str) -> Workflow {
    let mut out = workflow.clone();
    for node in out.values_mut() {
        if node.get("class_type").and_then(Value::as_str) != Some(IMAGE_NODE_CLASS) {
            continue;
        }
        rewrite_image_inputs(node, placeholder_name);
    }
    out
}

/// Rewrite a single job's target `LoadImage` node.
///
/// Prefers node id `"10"` when it exists and is a `LoadImage` node (matching
/// the convention most image templates use); otherwise falls back to the
/// first `LoadImage` node found by iteration order. Returns `Ok(node_id)`
/// naming which node was rewritten, or a warning-worthy `None` if no
/// `LoadImage` node exists in the graph at all.
pub fn rewrite_image(workflow: &Workflow, image_filename: &str) -> (Workflow, Option<String>) {
    let mut out = workflow.clone();

    if let Some(node) = out.get_mut(DEFAULT_IMAGE_NODE_ID)
        && node.get("class_type").and_then(Value::as_str) == Some(IMAGE_NODE_CLASS)
    {
        rewrite_image_inputs(node, image_filename);
        return (out, Some(DEFAULT_IMAGE_NODE_ID.to_string()));
    }

    let target_id = out
        .iter()
        .find(|(_, node)| node.get("class_type").and_then(Value::as_str) == Some(IMAGE_NODE_CLASS))
        .map(|(id, _)| id.clone());

    if let Some(id) = &target_id
        && let Some(node) = out.get_mut(id)
    {
        rewrite_image_inputs(node, image_filename);
    }

    (out, target_id)
}

fn rewrite_image_inputs(node: &mut Value, replacement: &str) {
    let Some(node_obj) = node.as_object_mut() else {
        return;
    };
    let inputs = node_obj
        .entry("inputs")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    let Some(inputs) = inputs.as_object_mut() else {
        return;
    };

    let keys: Vec<String> = inputs.keys().cloned().collect();
    for key in keys {
        let replace_with = match inputs.get(&key) {
            Some(Value::String(s)) if looks_like_image_ref(s) => {
                Some(Value::String(replacement.to_string()))
            }
            Some(Value::Array(items)) => {
                let mut changed = false;
                let new_items: Vec<Value> = items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) if s.ends_with(".png") || s.ends_with(".jpg") || s.contains("pasted/") => {
                            changed = true;
                            Value::String(replacement.to_string())
                        }
                        other => other.clone(),
                    })
                    .collect();
                if changed {
                    Some(Value::Array(new_items))
                } else {
                    None
                }
            }
            _ => None,
        };
        if let Some(v) = replace_with {
            inputs.insert(key, v);
        }
    }

    if !inputs.contains_key("image") {
        inputs.insert("image".to_string(), Value::String(replacement.to_string()));
    }
}

/// Rewrite a video job's target node (default id `"2"`), setting whichever
/// of `video`/`video_path` the node's class uses. Returns `Ok(node_id)` if
/// the target node exists and is a recognized video-loader class.
pub fn rewrite_video(
    workflow: &Workflow,
    video_filename: &str,
    target_node_id: Option<&str>,
) -> (Workflow, Option<String>) {
    let mut out = workflow.clone();
    let target_id = target_node_id.unwrap_or(DEFAULT_VIDEO_NODE_ID);

    let Some(node) = out.get_mut(target_id) else {
        return (out, None);
    };
    let class = node.get("class_type").and_then(Value::as_str).map(str::to_string);
    let Some(class) = class else {
        return (out, None);
    };
    if !VIDEO_NODE_CLASSES.contains(&class.as_str()) {
        return (out, None);
    }

    let Some(node_obj) = node.as_object_mut() else {
        return (out, None);
    };
    let inputs = node_obj
        .entry("inputs")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    let Some(inputs) = inputs.as_object_mut() else {
        return (out, None);
    };

    if inputs.contains_key("video") {
        inputs.insert("video".to_string(), Value::String(video_filename.to_string()));
    } else if inputs.contains_key("video_path") {
        inputs.insert("video_path".to_string(), Value::String(video_filename.to_string()));
    } else {
        inputs.insert("video".to_string(), Value::String(video_filename.to_string()));
    }

    (out, Some(target_id.to_string()))
}
