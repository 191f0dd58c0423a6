use std::sync::Arc;

use crate::{graph::GraphGenerator, identity::IdentityCheck, registry::SessionRegistry, settings::Settings};

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub identity: Arc<dyn IdentityCheck>,
    pub graph: GraphGenerator,
    pub settings: Arc<Settings>,
}
