//! Shared daemon state handed to every listener and background task.

use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use deckspot_proto::config::Config;
use deckspot_proto::events::EventSink;
use deckspot_proto::playback::PlaybackSnapshot;
use deckspot_proto::settings::SettingsStore;

use crate::api::SpotifyClient;
use crate::error::DaemonError;
use crate::oauth::OauthServer;
use crate::supervisor::Supervisor;
use crate::token::TokenManager;

/// A spawned task paired with its cancellation token. `stop()` cancels
/// and then waits for the task to actually finish.
pub struct TaskHandle {
    pub cancel: CancellationToken,
    pub join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

pub struct Daemon {
    pub config: Config,
    pub store: Arc<dyn SettingsStore>,
    pub sink: Arc<dyn EventSink>,
    pub tokens: Arc<TokenManager>,
    pub api: SpotifyClient,
    pub supervisor: Arc<Supervisor>,
    /// Last playback state observed by the poller.
    pub snapshot: Arc<RwLock<PlaybackSnapshot>>,
    pub poller: Mutex<Option<TaskHandle>>,
    pub oauth: Mutex<Option<OauthServer>>,
}

impl Daemon {
    pub fn new(
        config: Config,
        store: Arc<dyn SettingsStore>,
        sink: Arc<dyn EventSink>,
    ) -> anyhow::Result<Arc<Self>> {
        let tokens = Arc::new(TokenManager::new(store.clone())?);
        let supervisor = Arc::new(Supervisor::new(&config, store.clone(), sink.clone()));
        Ok(Arc::new(Self {
            config,
            store,
            sink,
            tokens,
            api: SpotifyClient::new()?,
            supervisor,
            snapshot: Arc::new(RwLock::new(PlaybackSnapshot::default())),
            poller: Mutex::new(None),
            oauth: Mutex::new(None),
        }))
    }

    /// A valid bearer token, refreshed if needed.
    pub async fn bearer(&self) -> Result<String, DaemonError> {
        self.tokens
            .ensure_valid_token()
            .await
            .ok_or(DaemonError::NotAuthenticated)
    }

    pub async fn playback_snapshot(&self) -> PlaybackSnapshot {
        self.snapshot.read().await.clone()
    }

    pub async fn start_poller(self: &Arc<Self>) {
        let mut slot = self.poller.lock().await;
        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        let cancel = CancellationToken::new();
        let daemon = Arc::clone(self);
        let token = cancel.clone();
        let join = tokio::spawn(async move { crate::poller::poll_loop(daemon, token).await });
        *slot = Some(TaskHandle { cancel, join });
    }

    pub async fn stop_poller(&self) {
        let handle = self.poller.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }
}
