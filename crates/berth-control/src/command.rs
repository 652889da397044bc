//! Worker launch command construction.
//!
//! `CommandBuilder::build` is a pure function from the deploy request,
//! the model's catalog metadata, the assigned port, and an optional
//! detected GPU count to a [`LaunchPlan`]. All host interaction (GPU
//! probing, launcher resolution) happens outside it.

use std::path::PathBuf;

use crate::catalog::ModelSpec;
use crate::config::DeployConfig;
use crate::types::DeployRequest;

/// Model id prefixes served natively by the default model source; all
/// other namespaces need the external-hub flag.
const NATIVE_NAMESPACES: [&str; 5] = ["Qwen/", "modelscope/", "damo/", "iic/", "AI-ModelScope/"];

/// Default context length for multimodal models.
const DEFAULT_MULTIMODAL_LEN: u32 = 2048;

/// Default context length for text-only models.
const DEFAULT_TEXT_LEN: u32 = 4096;

/// Default vision batch size for multimodal models.
const DEFAULT_VISION_BATCH: u32 = 2;

/// Everything needed to spawn a worker process.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    /// Launcher binary name (resolved to a path at spawn time).
    pub program: String,
    /// Arguments passed to the launcher.
    pub args: Vec<String>,
    /// Environment variables set for the worker.
    pub env: Vec<(String, String)>,
}

impl LaunchPlan {
    /// Render the plan as a single diagnostic command line.
    #[must_use]
    pub fn display(&self) -> String {
        let mut parts: Vec<String> = self
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Result of building a launch command.
#[derive(Debug, Clone)]
pub struct BuiltCommand {
    /// The launch plan.
    pub plan: LaunchPlan,
    /// The context length the worker will be started with.
    pub max_model_len: u32,
    /// Human-readable notes (clamping warnings, detection outcomes)
    /// destined for the deployment log.
    pub notes: Vec<String>,
}

/// Builds worker launch commands.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    launcher: String,
    fallback_gpu_count: u32,
}

impl CommandBuilder {
    /// Create a builder from the deploy configuration.
    #[must_use]
    pub fn new(config: &DeployConfig) -> Self {
        Self {
            launcher: config.launcher.clone(),
            fallback_gpu_count: config.fallback_gpu_count.max(1),
        }
    }

    /// Build the launch plan for one deployment.
    #[must_use]
    pub fn build(
        &self,
        request: &DeployRequest,
        model: &ModelSpec,
        port: u16,
        detected_gpu_count: Option<u32>,
    ) -> BuiltCommand {
        let mut notes = Vec::new();
        let mut env = Vec::new();

        // GPU visibility and parallelism degree.
        let mut tensor_parallel_size = request.tensor_parallel_size;
        if request.use_all_gpus {
            if tensor_parallel_size.is_none() {
                match detected_gpu_count {
                    Some(count) => {
                        tensor_parallel_size = Some(count);
                        notes.push(format!(
                            "Auto-detected {count} GPUs for tensor parallelism"
                        ));
                    }
                    None => {
                        let list = visibility_list(self.fallback_gpu_count);
                        notes.push(format!(
                            "GPU count detection failed; using default CUDA_VISIBLE_DEVICES={list}"
                        ));
                        env.push(("CUDA_VISIBLE_DEVICES".to_owned(), list));
                    }
                }
            }
            // An explicit parallelism degree leaves visibility
            // unconstrained; the launcher manages placement itself.
        } else {
            env.push(("CUDA_VISIBLE_DEVICES".to_owned(), request.gpu_id.to_string()));
        }

        if tensor_parallel_size.is_some_and(|n| n > 1) {
            env.push((
                "PYTORCH_CUDA_ALLOC_CONF".to_owned(),
                "expandable_segments:True".to_owned(),
            ));
        }

        if model.is_multimodal {
            env.push(("VLLM_USE_V1".to_owned(), "0".to_owned()));
        }

        // Context length, clamped to what the model supports.
        let limit = model.context_limit();
        let max_model_len = match request.max_model_len {
            None => {
                let default = if model.is_multimodal {
                    DEFAULT_MULTIMODAL_LEN
                } else {
                    DEFAULT_TEXT_LEN
                };
                default.min(limit)
            }
            Some(requested) if requested > limit => {
                notes.push(format!(
                    "Warning: requested max_model_len ({requested}) exceeds the model's maximum ({limit}); using {limit} instead"
                ));
                limit
            }
            Some(requested) => requested,
        };

        let mut args = vec![
            "deploy".to_owned(),
            "--model".to_owned(),
            model.model_id.clone(),
            "--infer_backend".to_owned(),
            "vllm".to_owned(),
            "--max_model_len".to_owned(),
            max_model_len.to_string(),
            "--gpu_memory_utilization".to_owned(),
            request.gpu_memory_utilization.to_string(),
            "--port".to_owned(),
            port.to_string(),
            "--host".to_owned(),
            "0.0.0.0".to_owned(),
        ];

        if let Some(size) = tensor_parallel_size.filter(|n| *n > 1) {
            args.push("--tensor-parallel-size".to_owned());
            args.push(size.to_string());
        }

        if let Some(architecture) = &request.architecture_override {
            args.push("--hf-overrides".to_owned());
            args.push(format!("{{\"architectures\": [\"{architecture}\"]}}"));
        }

        if model.is_multimodal {
            args.push("--vision_batch_size".to_owned());
            args.push(
                request
                    .vision_batch_size
                    .unwrap_or(DEFAULT_VISION_BATCH)
                    .to_string(),
            );
        }

        if needs_external_hub(&model.model_id) {
            args.push("--use_hf".to_owned());
            args.push("true".to_owned());
        }

        BuiltCommand {
            plan: LaunchPlan {
                program: self.launcher.clone(),
                args,
                env,
            },
            max_model_len,
            notes,
        }
    }
}

/// Whether a model id lives outside the default model source's
/// namespaces and needs the external-hub flag.
fn needs_external_hub(model_id: &str) -> bool {
    !NATIVE_NAMESPACES
        .iter()
        .any(|prefix| model_id.starts_with(prefix))
}

/// Render `0,1,...,count-1` for a GPU visibility list.
fn visibility_list(count: u32) -> String {
    (0..count)
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Resolve the launcher binary in PATH or common locations.
///
/// Falls back to the bare name when nothing is found; the spawn will
/// then fail and be recorded as a launch failure for that deployment.
#[must_use]
pub fn find_launcher(name: &str) -> PathBuf {
    if let Ok(path) = which::which(name) {
        return path;
    }

    for dir in ["/usr/local/bin", "~/.local/bin"] {
        let expanded = shellexpand::tilde(dir);
        let candidate = PathBuf::from(expanded.as_ref()).join(name);
        if candidate.exists() {
            return candidate;
        }
    }

    PathBuf::from(name)
}
