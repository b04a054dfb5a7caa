use chrono::Utc;
use serde_json::{json, Value};

use crate::models::{VideoFormat, WorkflowConfig};

const LOAD_IMAGE: &str = "52";
const POSITIVE: &str = "6";
const NEGATIVE: &str = "7";
const IMAGE_TO_VIDEO: &str = "50";
const SAMPLER: &str = "3";
const DECODE: &str = "8";

fn combine_format(format: VideoFormat) -> &'static str {
    match format {
        VideoFormat::Mp4 => "video/h264-mp4",
        VideoFormat::Webm => "video/webm",
        VideoFormat::Gif => "image/gif",
    }
}

pub fn effective_seed(config: &WorkflowConfig, now_millis: i64) -> u64 {
    if config.randomize_seed {
        now_millis.rem_euclid(1_000_000) as u64
    } else {
        config.seed
    }
}

pub fn frame_count(config: &WorkflowConfig) -> u32 {
    config.fps * config.duration + 1
}

/// Builds the node graph submitted to the backend for one rendering request.
/// `output_node` is the node the completion record will report the video under.
pub fn build_workflow(
    remote_image: &str,
    config: &WorkflowConfig,
    output_node: &str,
    now_millis: i64,
) -> Value {
    let mut graph = json!({
        LOAD_IMAGE: {
            "class_type": "LoadImage",
            "inputs": { "image": remote_image }
        },
        POSITIVE: {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": config.positive_prompt, "clip": ["38", 0] }
        },
        NEGATIVE: {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": config.negative_prompt, "clip": ["38", 0] }
        },
        IMAGE_TO_VIDEO: {
            "class_type": "WanImageToVideo",
            "inputs": {
                "positive": [POSITIVE, 0],
                "negative": [NEGATIVE, 0],
                "start_image": [LOAD_IMAGE, 0],
                "vae": ["39", 0],
                "width": 832,
                "height": 480,
                "length": frame_count(config),
                "batch_size": 1
            }
        },
        SAMPLER: {
            "class_type": "KSampler",
            "inputs": {
                "seed": effective_seed(config, now_millis),
                "steps": 20,
                "cfg": 7.0,
                "sampler_name": "euler",
                "scheduler": "normal",
                "denoise": 1.0,
                "model": ["37", 0],
                "positive": [IMAGE_TO_VIDEO, 0],
                "negative": [IMAGE_TO_VIDEO, 1],
                "latent_image": [IMAGE_TO_VIDEO, 2]
            }
        },
        DECODE: {
            "class_type": "VAEDecode",
            "inputs": { "samples": [SAMPLER, 0], "vae": ["39", 0] }
        }
    });

    graph[output_node] = json!({
        "class_type": "VHS_VideoCombine",
        "inputs": {
            "images": [DECODE, 0],
            "frame_rate": config.fps,
            "loop_count": 0,
            "filename_prefix": "vidflow",
            "format": combine_format(config.format),
            "save_output": true
        }
    });

    graph
}

pub fn build_workflow_now(remote_image: &str, config: &WorkflowConfig, output_node: &str) -> Value {
    build_workflow(remote_image, config, output_node, Utc::now().timestamp_millis())
}
