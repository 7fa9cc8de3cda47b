//! Process-wide services, constructed once at startup and passed through
//! context. Tests swap individual pieces for in-memory fakes behind the
//! same interfaces.

use std::sync::Arc;

use crate::config::Settings;
use crate::config_loader::ConfigLoader;
use crate::esl::client::EslClient;
use crate::esl::relay::RelayRegistry;
use crate::handoff::storage::RecordingUploader;
use crate::handoff::OrchestratorClient;
use crate::metrics::BridgeMetrics;
use crate::providers::ProviderFactory;
use crate::rate_limit::TenantRateLimiter;
use crate::store::{ConfigStore, ConversationStore};
use crate::transfer::announce::AnnouncementTts;

pub struct Services {
    pub settings: Settings,
    pub config: Arc<ConfigLoader>,
    pub conversations: Arc<dyn ConversationStore>,
    pub metrics: Arc<BridgeMetrics>,
    pub limits: Arc<TenantRateLimiter>,
    pub uploader: Arc<RecordingUploader>,
    pub orchestrator: Arc<OrchestratorClient>,
    pub esl_client: Arc<EslClient>,
    pub relays: Arc<RelayRegistry>,
    pub announce_tts: Arc<AnnouncementTts>,
    pub provider_factory: ProviderFactory,
}

impl Services {
    pub fn new(
        settings: Settings,
        config_store: Arc<dyn ConfigStore>,
        conversations: Arc<dyn ConversationStore>,
    ) -> Result<Arc<Self>, prometheus::Error> {
        Self::with_factory(
            settings,
            config_store,
            conversations,
            crate::providers::default_factory(),
        )
    }

    pub fn with_factory(
        settings: Settings,
        config_store: Arc<dyn ConfigStore>,
        conversations: Arc<dyn ConversationStore>,
        provider_factory: ProviderFactory,
    ) -> Result<Arc<Self>, prometheus::Error> {
        let esl_client = Arc::new(EslClient::new(
            settings.esl_host.clone(),
            settings.esl_port,
            settings.esl_password.clone(),
        ));
        let orchestrator = Arc::new(OrchestratorClient::new(
            settings.orchestrator_api_url.clone(),
            settings.orchestrator_service_token.clone(),
        ));
        let uploader = Arc::new(RecordingUploader::new(settings.storage.clone()));

        let announce_tts = Arc::new(AnnouncementTts::new(
            std::env::var("ELEVENLABS_API_KEY").ok(),
        ));

        Ok(Arc::new(Self {
            config: Arc::new(ConfigLoader::new(config_store)),
            conversations,
            metrics: Arc::new(BridgeMetrics::new()?),
            limits: Arc::new(TenantRateLimiter::default()),
            uploader,
            orchestrator,
            esl_client,
            relays: Arc::new(RelayRegistry::new()),
            announce_tts,
            provider_factory,
            settings,
        }))
    }
}
