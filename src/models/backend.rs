// Opaque model resource boundary. The pipeline drives generation through
// `TextGenBackend` and never sees tensors or devices; `CandleLoader` is the
// production implementation, test code substitutes scripted backends.

use anyhow::Result;
use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache, Config as LlamaConfig, Llama, LlamaEosToks};
use hf_hub::{Repo, RepoType, api::sync::Api};
use serde_json::Value;
use std::fs;
use tokenizers::Tokenizer;

use crate::config::ModelSettings;
use crate::models::registry::ModelConfig;

/// Tokenize / generate / decode capability of one loaded model.
///
/// A backend is exclusively owned by its `ModelHandler`; the loaded context is
/// assumed non-reentrant, so calls are serialized by the handler's critical
/// section.
pub trait TextGenBackend: Send {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, tokens: &[u32]) -> Result<String>;

    /// Reset per-generation state (KV cache). Called once before each
    /// sampling loop.
    fn begin_session(&mut self) -> Result<()>;

    /// Feed `tokens` starting at `index_pos` and return the next-token
    /// logits over the vocabulary.
    fn forward(&mut self, tokens: &[u32], index_pos: usize) -> Result<Vec<f32>>;

    fn is_eos(&self, token: u32) -> bool;

    /// Release held resources ahead of a switch. Errors are logged by the
    /// caller; release is considered complete either way.
    fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Factory seam for acquiring a backend bound to a model configuration.
#[async_trait]
pub trait BackendLoader: Send + Sync {
    async fn load(
        &self,
        config: &ModelConfig,
        settings: &ModelSettings,
    ) -> Result<Box<dyn TextGenBackend>>;
}

/// Production loader: candle Llama-family weights pulled from the HuggingFace
/// hub, with accelerator-first device selection.
pub struct CandleLoader;

#[async_trait]
impl BackendLoader for CandleLoader {
    async fn load(
        &self,
        config: &ModelConfig,
        settings: &ModelSettings,
    ) -> Result<Box<dyn TextGenBackend>> {
        let repo_id = config.canonical_id.to_string();
        let max_context = settings.max_context;
        // hf-hub's sync API blocks on network and disk IO.
        let backend =
            tokio::task::spawn_blocking(move || CandleBackend::load_sync(&repo_id, max_context))
                .await??;
        Ok(Box::new(backend))
    }
}

pub struct CandleBackend {
    model: Llama,
    tokenizer: Tokenizer,
    llama_config: LlamaConfig,
    cache: Option<Cache>,
    device: Device,
    dtype: DType,
}

impl CandleBackend {
    fn load_sync(repo_id: &str, max_context: usize) -> Result<Self> {
        let device = Self::select_device();
        // Reduced precision only on the accelerator path: F16 on CPU both
        // hits unsupported ops and degrades output quality.
        let dtype = if matches!(device, Device::Cpu) {
            DType::F32
        } else {
            DType::F16
        };
        tracing::info!(repo = repo_id, device = ?device, dtype = ?dtype, "loading model");

        let api = Api::new()?;
        let repo = api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            "main".to_string(),
        ));

        let config_file = repo
            .get("config.json")
            .map_err(|e| anyhow::anyhow!("Failed to download config.json: {}", e))?;
        let tokenizer_file = repo
            .get("tokenizer.json")
            .map_err(|e| anyhow::anyhow!("Failed to download tokenizer.json: {}", e))?;

        let config_json = fs::read_to_string(&config_file)?;
        let tokenizer = Tokenizer::from_file(&tokenizer_file)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

        let llama_config = Self::parse_llama_config(&config_json, max_context)?;
        tracing::info!(
            vocab_size = llama_config.vocab_size,
            hidden_size = llama_config.hidden_size,
            num_layers = llama_config.num_hidden_layers,
            "parsed model config"
        );

        let weight_files = Self::download_weight_files(&repo)?;
        let vars = Self::load_weights(&weight_files, dtype, &device)?;

        tracing::info!("building model graph...");
        let model = Llama::load(vars, &llama_config)?;

        Ok(Self {
            model,
            tokenizer,
            llama_config,
            cache: None,
            device,
            dtype,
        })
    }

    // Prefer an available accelerator, else general-purpose compute.
    fn select_device() -> Device {
        if candle_core::utils::cuda_is_available() {
            match Device::new_cuda(0) {
                Ok(device) => {
                    tracing::info!("CUDA GPU available, using acceleration");
                    return device;
                }
                Err(e) => tracing::warn!("failed to initialize CUDA: {}, trying Metal", e),
            }
        }
        if candle_core::utils::metal_is_available() {
            match Device::new_metal(0) {
                Ok(device) => {
                    tracing::info!("Metal GPU available, using acceleration");
                    return device;
                }
                Err(e) => tracing::warn!("failed to initialize Metal: {}, using CPU", e),
            }
        }
        tracing::info!("using CPU for inference");
        Device::Cpu
    }

    fn parse_llama_config(config_json: &str, max_context: usize) -> Result<LlamaConfig> {
        let config: Value = serde_json::from_str(config_json)?;

        let vocab_size = config["vocab_size"].as_u64().unwrap_or(32000) as usize;
        let hidden_size = config["hidden_size"].as_u64().unwrap_or(2048) as usize;
        let intermediate_size = config["intermediate_size"].as_u64().unwrap_or(5632) as usize;
        let num_hidden_layers = config["num_hidden_layers"].as_u64().unwrap_or(22) as usize;
        let num_attention_heads = config["num_attention_heads"].as_u64().unwrap_or(32) as usize;
        let num_key_value_heads = config
            .get("num_key_value_heads")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(4);
        let rms_norm_eps = config["rms_norm_eps"].as_f64().unwrap_or(1e-5);
        let rope_theta = config
            .get("rope_theta")
            .and_then(|v| v.as_f64())
            .unwrap_or(10000.0);
        let max_position_embeddings = config
            .get("max_position_embeddings")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(2048)
            .min(max_context);

        Ok(LlamaConfig {
            vocab_size,
            hidden_size,
            intermediate_size,
            num_hidden_layers,
            num_attention_heads,
            num_key_value_heads,
            rms_norm_eps,
            rope_theta: rope_theta as f32,
            max_position_embeddings,
            bos_token_id: Some(
                config
                    .get("bos_token_id")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(1) as u32,
            ),
            eos_token_id: Some(LlamaEosToks::Single(
                config
                    .get("eos_token_id")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(2) as u32,
            )),
            rope_scaling: None,
            tie_word_embeddings: config
                .get("tie_word_embeddings")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            use_flash_attn: false,
        })
    }

    fn download_weight_files(repo: &hf_hub::api::sync::ApiRepo) -> Result<Vec<std::path::PathBuf>> {
        let possible_patterns = vec![
            vec!["model.safetensors".to_string()],
            (1..=2)
                .map(|i| format!("model-{i:05}-of-00002.safetensors"))
                .collect::<Vec<_>>(),
            (1..=3)
                .map(|i| format!("model-{i:05}-of-00003.safetensors"))
                .collect::<Vec<_>>(),
            vec!["pytorch_model.bin".to_string()],
            (1..=2)
                .map(|i| format!("pytorch_model-{i:05}-of-00002.bin"))
                .collect::<Vec<_>>(),
        ];

        for pattern in possible_patterns {
            let mut pattern_files = Vec::new();
            let mut all_found = true;

            for filename in &pattern {
                match repo.get(filename) {
                    Ok(path) => {
                        tracing::debug!("found weight file: {}", filename);
                        pattern_files.push(path);
                    }
                    Err(_) => {
                        all_found = false;
                        break;
                    }
                }
            }

            if all_found && !pattern_files.is_empty() {
                tracing::info!("found {} weight file(s)", pattern_files.len());
                return Ok(pattern_files);
            }
        }

        Err(anyhow::anyhow!("No model weight files found"))
    }

    fn load_weights<'a>(
        weight_files: &'a [std::path::PathBuf],
        dtype: DType,
        device: &'a Device,
    ) -> Result<VarBuilder<'a>> {
        if weight_files[0].extension().and_then(|s| s.to_str()) == Some("safetensors") {
            tracing::info!("loading safetensors weights...");
            unsafe {
                Ok(VarBuilder::from_mmaped_safetensors(
                    weight_files,
                    dtype,
                    device,
                )?)
            }
        } else {
            tracing::info!("loading PyTorch weights...");
            let mut all_tensors = std::collections::HashMap::new();
            for weight_file in weight_files {
                let tensors_vec = candle_core::pickle::read_all(weight_file)?;
                let tensors: std::collections::HashMap<String, Tensor> =
                    tensors_vec.into_iter().collect();
                all_tensors.extend(tensors);
            }
            Ok(VarBuilder::from_tensors(all_tensors, dtype, device))
        }
    }
}

impl TextGenBackend for CandleBackend {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow::anyhow!("Decoding failed: {}", e))
    }

    fn begin_session(&mut self) -> Result<()> {
        // Fresh KV cache per generation; stale entries corrupt positions.
        self.cache = Some(Cache::new(
            true,
            self.dtype,
            &self.llama_config,
            &self.device,
        )?);
        Ok(())
    }

    fn forward(&mut self, tokens: &[u32], index_pos: usize) -> Result<Vec<f32>> {
        let cache = self
            .cache
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("forward called before begin_session"))?;

        let input = Tensor::from_vec(tokens.to_vec(), (1, tokens.len()), &self.device)?;
        let output = self.model.forward(&input, index_pos, cache)?;

        let logits = output.squeeze(0)?;
        let last_logits = if logits.dims().len() == 2 {
            logits.get(logits.dim(0)? - 1)?
        } else {
            logits
        };

        Ok(last_logits.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }

    fn is_eos(&self, token: u32) -> bool {
        if let Some(LlamaEosToks::Single(eos_id)) = &self.llama_config.eos_token_id {
            if token == *eos_id {
                return true;
            }
        }
        for marker in ["</s>", "<|endoftext|>", "<|EOT|>"] {
            if let Some(eos_id) = self.tokenizer.token_to_id(marker) {
                if token == eos_id {
                    return true;
                }
            }
        }
        false
    }

    fn release(&mut self) -> Result<()> {
        self.cache = None;
        Ok(())
    }
}
