use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::debug;

use crate::comm::handler::{HandlerFactory, MessageHandler};
use crate::config::{CommunicatorConfig, RawChannelConfig};

/// Everything communicators created by one application have in common: configuration, the
///  source of session ids, and handler factories that are applied to every new communicator.
pub struct CommunicatorContext {
    pub config: Arc<CommunicatorConfig>,
    pub raw_channel_config: Arc<RawChannelConfig>,
    session_id_counter: AtomicU64,
    handler_factories: RwLock<Vec<HandlerFactory>>,
}

impl CommunicatorContext {
    pub fn new(config: CommunicatorConfig, raw_channel_config: RawChannelConfig) -> anyhow::Result<Arc<CommunicatorContext>> {
        config.validate()?;
        raw_channel_config.validate(&config)?;

        Ok(Arc::new(CommunicatorContext {
            config: Arc::new(config),
            raw_channel_config: Arc::new(raw_channel_config),
            session_id_counter: AtomicU64::new(1),
            handler_factories: Default::default(),
        }))
    }

    pub fn default_context() -> Arc<CommunicatorContext> {
        Arc::new(CommunicatorContext {
            config: Arc::new(CommunicatorConfig::default_config()),
            raw_channel_config: Arc::new(RawChannelConfig::default_config()),
            session_id_counter: AtomicU64::new(1),
            handler_factories: Default::default(),
        })
    }

    /// unique and increasing for all communicators of this context
    pub fn next_session_id(&self) -> u64 {
        self.session_id_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a factory that is invoked for every communicator created afterwards. Existing
    ///  communicators are not affected.
    pub async fn register_handler_factory(&self, factory: HandlerFactory) {
        debug!("registering global handler factory");
        self.handler_factories.write().await
            .push(factory);
    }

    pub async fn create_global_handlers(&self) -> Vec<Arc<dyn MessageHandler>> {
        self.handler_factories.read().await
            .iter()
            .map(|f| f())
            .collect()
    }
}
