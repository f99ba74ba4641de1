use std::sync::Arc;

use tracing::instrument;

use crate::auth::{
    AuthError, AuthPipeline, CredentialRefresher, CredentialStore, Credentials, RefresherHandle,
    Session,
};
use crate::command::{CommandDispatcher, CommandError, CommandResult, DesiredState};
use crate::config::Config;
use crate::directory::{Device, DeviceDirectory, DirectoryError};

/// Collaborator-facing surface of the crate: owns the session for one
/// account and wires the pipeline, store, refresher, directory and
/// dispatcher together.
///
/// Must be constructed inside a Tokio runtime; creation starts the
/// background credential refresher, which runs until the client is dropped
/// or [`Client::shutdown`] is called.
pub struct Client {
    store: Arc<CredentialStore>,
    pipeline: Arc<AuthPipeline>,
    directory: DeviceDirectory,
    dispatcher: CommandDispatcher,
    refresher_handle: RefresherHandle,
}

impl Client {
    pub fn new(config: Config, email: &str, password: &str) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(CredentialStore::new());
        let pipeline = Arc::new(AuthPipeline::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Some(Credentials::new(email, password)),
        ));
        let refresher = Arc::new(CredentialRefresher::new(
            Arc::clone(&pipeline),
            Arc::clone(&store),
            config.refresh.clone(),
        ));
        let refresher_handle = refresher.start();
        let directory = DeviceDirectory::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&refresher),
        );
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&refresher),
        );

        Self {
            store,
            pipeline,
            directory,
            dispatcher,
            refresher_handle,
        }
    }

    /// Runs the full login chain and returns the established session.
    pub async fn login(&self) -> Result<Session, AuthError> {
        self.pipeline.login().await
    }

    /// The current session snapshot; state and expiry metadata only.
    pub fn session(&self) -> Session {
        self.store.session()
    }

    /// Fetches the registered devices, replacing the cached list.
    pub async fn list_devices(&self) -> Result<Vec<Device>, DirectoryError> {
        self.directory.list_devices().await
    }

    /// Dispatches a desired state to the device with the given id and
    /// reports the broker's verdict.
    #[instrument(skip_all, fields(device = device_id), err)]
    pub async fn send_command(
        &self,
        device_id: &str,
        desired: DesiredState,
    ) -> Result<CommandResult, CommandError> {
        let device = self.find_device(device_id).await?;
        self.dispatcher.send(&device, &desired).await
    }

    /// Resolves a device from the cached directory snapshot, fetching the
    /// list once if the device is not yet known.
    async fn find_device(&self, device_id: &str) -> Result<Device, CommandError> {
        let cached = self.directory.cached();
        if let Some(device) = cached.iter().find(|device| device.id == device_id) {
            return Ok(device.clone());
        }

        match self.directory.list_devices().await {
            Ok(devices) => devices
                .into_iter()
                .find(|device| device.id == device_id)
                .ok_or_else(|| CommandError::UnknownDevice(device_id.to_string())),
            Err(DirectoryError::SessionUnavailable) => Err(CommandError::SessionUnavailable),
            Err(DirectoryError::Network(err)) => Err(CommandError::Network(err)),
            Err(DirectoryError::Rejected { .. }) => {
                Err(CommandError::UnknownDevice(device_id.to_string()))
            }
        }
    }

    /// Stops the background refresher. The session itself stays readable.
    pub fn shutdown(&self) {
        self.refresher_handle.stop();
    }
}
