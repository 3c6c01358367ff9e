//! State shared by input and output buffers.

use std::collections::BTreeSet;
use std::sync::Arc;

use iubus_core::{generate_instance_id, EventMask, IuEventType};
use iubus_transport::{BufferRole, Scope, Transport};

use crate::config::BufferConfig;
use crate::handler::{HandlerFn, HandlerRegistry};
use crate::iu::Iu;

pub(crate) struct BufferCore {
    unique_name: String,
    instance_id: String,
    config: BufferConfig,
    transport: Arc<dyn Transport>,
    handlers: HandlerRegistry,
}

impl BufferCore {
    pub(crate) fn new(config: BufferConfig, transport: Arc<dyn Transport>, role: BufferRole) -> Self {
        let instance_id = generate_instance_id();
        let unique_name = Scope::component(&config.basename, &instance_id, role)
            .as_str()
            .to_string();
        Self {
            unique_name,
            instance_id,
            config,
            transport,
            handlers: HandlerRegistry::default(),
        }
    }

    /// `component/<basename>-<id>/OB` or `.../IB`.
    pub(crate) fn unique_name(&self) -> &str {
        &self.unique_name
    }

    pub(crate) fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub(crate) fn channel(&self) -> &str {
        &self.config.channel
    }

    pub(crate) fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn category_scope(&self, category: &str) -> Scope {
        Scope::category(&self.config.channel, category)
    }

    pub(crate) fn register_handler(
        &self,
        handler: Arc<HandlerFn>,
        mask: EventMask,
        categories: BTreeSet<String>,
    ) {
        self.handlers.register(handler, mask, categories);
    }

    pub(crate) fn dispatch(&self, iu: &Iu, event: IuEventType, local: bool) -> usize {
        tracing::trace!(buffer = %self.unique_name, uid = iu.uid(), %event, local, "dispatch");
        self.handlers.dispatch(iu, event, local)
    }
}
