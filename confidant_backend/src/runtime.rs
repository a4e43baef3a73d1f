use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use flume::Receiver;

use crate::affect::LlmAffectExtractor;
use crate::config::{BackendConfig, MemoryBackendKind};
use crate::llm_client::{ChatModel, LlmClient};
use crate::memory::local::LocalMemory;
use crate::memory::remote::{RemoteEpisodicStore, RemoteGraphStore};
use crate::memory::MemoryGateway;
use crate::persona::PersonaCompiler;
use crate::reconstruct::{Reconstructor, ReconstructorOptions};
use crate::safety::LlmSafetyGate;
use crate::turn::detached::log_diagnostic;
use crate::turn::{Diagnostic, DiagnosticsSink, TurnOptions, TurnOrchestrator};

pub struct BackendRuntime {
    pub config: BackendConfig,
    pub memory: MemoryGateway,
    pub orchestrator: TurnOrchestrator,
    pub persona: Arc<PersonaCompiler>,
    pub reconstructor: Arc<Reconstructor>,
    remote_episodic: Option<Arc<RemoteEpisodicStore>>,
    diagnostics_rx: Receiver<Diagnostic>,
}

impl BackendRuntime {
    /// Wire every component from configuration. Missing credentials or
    /// endpoints fail here, before any request is served.
    pub fn bootstrap(config: BackendConfig) -> Result<Self> {
        let client = LlmClient::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
        )
        .with_sampling(config.llm_temperature, config.llm_max_tokens);
        tracing::info!("Chat model: {} at {}", client.model(), config.llm_api_url);
        let model: Arc<dyn ChatModel> = Arc::new(client);
        Self::bootstrap_with_model(config, model)
    }

    pub fn bootstrap_with_model(config: BackendConfig, model: Arc<dyn ChatModel>) -> Result<Self> {
        config.validate().context("Invalid backend configuration")?;
        let (memory, remote_episodic) = build_memory(&config)?;

        let (diagnostics, diagnostics_rx) = DiagnosticsSink::channel();
        let affect = Arc::new(LlmAffectExtractor::new(model.clone()));
        let orchestrator = TurnOrchestrator::new(
            Arc::new(LlmSafetyGate::new(model.clone())),
            affect.clone(),
            memory.clone(),
            model.clone(),
        )
        .with_options(TurnOptions {
            affect_mode: config.affect_mode,
            search_limit: config.search_limit,
        })
        .with_diagnostics(diagnostics);

        let persona = Arc::new(PersonaCompiler::new(model.clone()));
        let reconstructor = Arc::new(Reconstructor::new(
            memory.clone(),
            affect,
            model,
            ReconstructorOptions::from(&config),
        ));

        tracing::info!(
            "Backend runtime ready (model: {}, memory: {:?}, affect: {:?})",
            config.llm_model,
            config.memory_backend,
            config.affect_mode
        );

        Ok(Self {
            config,
            memory,
            orchestrator,
            persona,
            reconstructor,
            remote_episodic,
            diagnostics_rx,
        })
    }

    /// Push the category taxonomy to the hosted episodic store. Best effort.
    pub async fn provision_memory(&self) {
        if !self.config.provision_memory_project {
            return;
        }
        let Some(store) = self.remote_episodic.as_ref() else {
            return;
        };
        match store.provision_project().await {
            Ok(()) => tracing::info!("Memory project categories provisioned"),
            Err(e) => tracing::warn!("Could not provision memory project: {:#}", e),
        }
    }

    /// Forward detached-task failures into the log. Must run inside a runtime.
    pub fn spawn_diagnostics_drain(&self) -> tokio::task::JoinHandle<()> {
        let rx = self.diagnostics_rx.clone();
        tokio::spawn(async move {
            while let Ok(diagnostic) = rx.recv_async().await {
                log_diagnostic(&diagnostic);
            }
        })
    }
}

fn build_memory(config: &BackendConfig) -> Result<(MemoryGateway, Option<Arc<RemoteEpisodicStore>>)> {
    match config.memory_backend {
        MemoryBackendKind::Local => {
            let local = LocalMemory::new(&config.database_path, config.memory_page_size_ceiling)
                .with_context(|| format!("Failed to open memory database {}", config.database_path))?;
            tracing::info!("Using local memory at {}", config.database_path);
            let memory = MemoryGateway::new(Arc::new(local.clone()), Arc::new(local));
            Ok((memory, None))
        }
        MemoryBackendKind::Remote => {
            let memory_url = config
                .memory_api_url
                .as_deref()
                .ok_or_else(|| anyhow!("memory_api_url is not set"))?;
            let memory_key = config
                .memory_api_key
                .as_deref()
                .ok_or_else(|| anyhow!("memory_api_key is not set"))?;
            let graph_url = config
                .graph_api_url
                .as_deref()
                .ok_or_else(|| anyhow!("graph_api_url is not set"))?;

            let episodic = Arc::new(RemoteEpisodicStore::new(
                memory_url,
                memory_key,
                config.memory_page_size_ceiling,
            ));
            let graph = Arc::new(RemoteGraphStore::new(graph_url, config.graph_api_key.clone()));
            tracing::info!("Using remote memory at {} (graph: {})", memory_url, graph_url);
            Ok((MemoryGateway::new(episodic.clone(), graph), Some(episodic)))
        }
    }
}
