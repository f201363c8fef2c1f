// Model lifecycle owner. One handler instance is active per service process,
// wrapped in `Arc<tokio::sync::Mutex<_>>` so load, switch, and generate all
// serialize through a single exclusive critical section.

use std::sync::Arc;

use anyhow::anyhow;

use crate::config::ModelSettings;
use crate::error::{Error, Result};
use crate::models::backend::{BackendLoader, TextGenBackend};
use crate::models::pipeline;
use crate::models::registry::{self, ModelConfig};
use crate::models::{GenerationRequest, GenerationResult};

/// Lifecycle of the held model resource.
///
/// Transitions are `Unloaded -> Loading -> {Ready | Failed}`. `Failed` is
/// terminal for this instance; recovery means constructing a new handler.
#[derive(Debug, Clone)]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
    Failed(String),
}

pub struct ModelHandler {
    config: ModelConfig,
    state: LoadState,
    backend: Option<Box<dyn TextGenBackend>>,
    loader: Arc<dyn BackendLoader>,
    settings: ModelSettings,
}

impl ModelHandler {
    /// Validates `key` against the registry; the handler starts `Unloaded`.
    pub fn new(key: &str, settings: ModelSettings, loader: Arc<dyn BackendLoader>) -> Result<Self> {
        let config = registry::global()?.get(key)?.clone();
        Ok(Self {
            config,
            state: LoadState::Unloaded,
            backend: None,
            loader,
            settings,
        })
    }

    pub fn active_key(&self) -> &str {
        self.config.key
    }

    pub fn state(&self) -> &LoadState {
        &self.state
    }

    /// Acquire tokenizer and model resources for the active configuration.
    pub async fn load(&mut self) -> Result<()> {
        match &self.state {
            LoadState::Ready => return Ok(()),
            LoadState::Failed(cause) => {
                return Err(Error::Load(anyhow!(
                    "handler for '{}' previously failed to load: {cause}; construct a new handler",
                    self.config.key
                )));
            }
            LoadState::Loading => {
                return Err(Error::Load(anyhow!(
                    "load already in progress for '{}'",
                    self.config.key
                )));
            }
            LoadState::Unloaded => {}
        }

        self.state = LoadState::Loading;
        tracing::info!(
            model = self.config.key,
            repo = self.config.canonical_id,
            "loading model"
        );

        match self.loader.load(&self.config, &self.settings).await {
            Ok(backend) => {
                self.backend = Some(backend);
                self.state = LoadState::Ready;
                tracing::info!(model = self.config.key, "model loaded successfully");
                Ok(())
            }
            Err(e) => {
                let cause = format!("{e:#}");
                tracing::error!(model = self.config.key, error = %cause, "model load failed");
                self.backend = None;
                self.state = LoadState::Failed(cause);
                Err(Error::Load(e))
            }
        }
    }

    /// Switch to another registered model.
    ///
    /// Release-then-acquire: the current backend is released before the new
    /// one loads, trading a load-time gap for bounded peak memory. A failed
    /// acquire leaves the handler `Failed`, never pointing at the old config.
    pub async fn switch(&mut self, new_key: &str) -> Result<()> {
        if new_key == self.config.key {
            tracing::debug!(model = new_key, "switch to active model is a no-op");
            return Ok(());
        }
        if let LoadState::Failed(cause) = &self.state {
            return Err(Error::Load(anyhow!(
                "handler previously failed to load: {cause}; construct a new handler"
            )));
        }

        // Resolve the target before touching current resources, so an unknown
        // key mutates nothing.
        let new_config = registry::global()?.get(new_key)?.clone();

        if let Some(mut backend) = self.backend.take() {
            tracing::info!(from = self.config.key, to = new_key, "releasing current model");
            if let Err(e) = backend.release() {
                tracing::warn!(model = self.config.key, error = %e, "backend release reported an error");
            }
        }

        self.config = new_config;
        self.state = LoadState::Unloaded;
        self.load().await
    }

    /// Run one generation request against the active model.
    ///
    /// Implicitly loads from `Unloaded`; fails fast from `Failed`. Pipeline
    /// failures never mutate the load state.
    pub async fn generate(&mut self, request: GenerationRequest) -> Result<GenerationResult> {
        if let Some(key) = request.model_key.as_deref() {
            if key != self.config.key {
                self.switch(key).await?;
            }
        }

        match &self.state {
            LoadState::Failed(cause) => {
                return Err(Error::Generation(anyhow!(
                    "model '{}' previously failed to load: {cause}",
                    self.config.key
                )));
            }
            LoadState::Unloaded => self.load().await?,
            LoadState::Loading | LoadState::Ready => {}
        }

        let formatted = pipeline::format_prompt(&request.prompt, self.config.prompt_template)?;
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| Error::Generation(anyhow!("no backend loaded")))?;

        let (raw, latency_seconds) = pipeline::sample(
            backend.as_mut(),
            &formatted,
            request.max_tokens,
            request.temperature,
            self.config.stop_sequences,
            self.settings.max_context,
        )?;
        let text = pipeline::extract_answer(&raw, &formatted, &self.config);

        Ok(GenerationResult {
            text,
            latency_seconds,
            model_used: self.config.key.to_string(),
        })
    }
}
