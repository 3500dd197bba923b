//! 引擎构建器：统一的 SessionEngine 初始化逻辑
//!
//! CLI 与 HTTP 入口共用：按配置选择 LLM 后端（每个阶段一个客户端）与 KV 存储。

use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::StoreError;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::session::{SessionEngine, StageClients};
use crate::store::{create_kv_store, KvStore};

/// 引擎构建器：持有配置，可替换 LLM 或存储（测试用）
pub struct EngineBuilder {
    config: AppConfig,
    clients: Option<StageClients>,
    store: Option<Arc<dyn KvStore>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            clients: None,
            store: None,
        }
    }

    /// 三个阶段共用一个客户端
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.clients = Some(StageClients::shared(llm));
        self
    }

    pub fn with_clients(mut self, clients: StageClients) -> Self {
        self.clients = Some(clients);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 按 [llm] 段构建各阶段客户端；openai 但无 API Key 时回退 Mock
    pub fn build_clients(&self) -> StageClients {
        let llm = &self.config.llm;
        let provider = llm.provider.to_lowercase();
        let api_key = std::env::var("OPENAI_API_KEY").ok();

        if provider == "openai" && api_key.is_some() {
            let base = llm.base_url.as_deref();
            let make = |model: &str| -> Arc<dyn LlmClient> {
                let client = OpenAiClient::new(base, model, api_key.as_deref());
                tracing::info!("Using OpenAI LLM ({})", client.model());
                Arc::new(client)
            };
            StageClients {
                perception: make(&llm.perception_model),
                planner: make(&llm.planner_model),
                verifier: make(&llm.verifier_model),
            }
        } else {
            if provider != "mock" {
                tracing::warn!("No API key set or provider unknown, using Mock LLM");
            }
            StageClients::shared(Arc::new(MockLlmClient))
        }
    }

    /// 配置了 sqlite_path 但打不开时返回错误，不静默回退内存
    pub fn build_store(&self) -> Result<Arc<dyn KvStore>, StoreError> {
        create_kv_store(self.config.store.sqlite_path.as_deref())
    }

    pub fn build(self) -> Result<SessionEngine, StoreError> {
        let clients = self.clients.clone().unwrap_or_else(|| self.build_clients());
        let store = match self.store.clone() {
            Some(store) => store,
            None => self.build_store()?,
        };
        Ok(SessionEngine::new(
            store,
            clients,
            self.config.session.engine_settings(),
        ))
    }
}

/// 从配置一步创建引擎
pub fn create_engine(config: AppConfig) -> Result<SessionEngine, StoreError> {
    EngineBuilder::new(config).build()
}
