use std::sync::Arc;

use shared::{domain::ConnectionStatus, protocol::UiEvent};
use tokio::sync::{broadcast, watch};

use crate::{controller::ControllerHandle, overlay::BroadcastHub};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) hub: Arc<BroadcastHub>,
    pub(crate) timer: ControllerHandle,
    pub(crate) ui: broadcast::Sender<UiEvent>,
    pub(crate) feed_status: watch::Receiver<ConnectionStatus>,
}
