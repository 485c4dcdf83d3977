//! The high-level client facade.
//!
//! [`WavelineClient`] wires the session manager, the persistent connection,
//! the callback registry, and the media collaborator together behind one
//! surface: register, connect, send, subscribe.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use wl_auth::api::{AuthBackend, HttpAuthApi};
use wl_auth::{CredentialStore, SessionManager};
use wl_core::config::AppConfig;
use wl_core::constants::{frame_types, presence};
use wl_core::error::{WlError, WlResult};
use wl_core::jid;
use wl_socket::{ConnectionManager, ConnectionState, Transport, WsTransport};
use wl_wire::payload;
use wl_wire::registry::{CallbackCategory, Dispatch};

/// The Waveline messaging client.
pub struct WavelineClient {
    session: Arc<SessionManager>,
    connection: Arc<ConnectionManager>,
    media: crate::media::MediaClient,
}

impl WavelineClient {
    /// Create a client from configuration, using the production HTTP and
    /// WebSocket stacks.
    pub fn new(config: AppConfig) -> WlResult<Self> {
        let backend = Arc::new(HttpAuthApi::new(
            &config.auth.server,
            &config.connection.user_agent,
            config.connection.request_timeout(),
        )?);
        Self::build(config, backend, Arc::new(WsTransport))
    }

    fn build(
        config: AppConfig,
        backend: Arc<dyn AuthBackend>,
        transport: Arc<dyn Transport>,
    ) -> WlResult<Self> {
        let store = CredentialStore::load(config.effective_credentials_path()?)?;
        let session = Arc::new(SessionManager::new(
            backend,
            store,
            &config.auth.server,
            &config.auth.protocol_version,
        ));
        let registry = Arc::new(wl_wire::registry::CallbackRegistry::default());
        let connection = ConnectionManager::new(
            config.connection.clone(),
            session.clone(),
            registry,
            transport,
        );
        let media = crate::media::MediaClient::new(
            session.clone(),
            config.effective_media_dir()?,
            &config.connection.user_agent,
            config.connection.request_timeout(),
        )?;

        Ok(Self {
            session,
            connection,
            media,
        })
    }

    // --- account lifecycle ---

    /// Request a verification code for `phone` via "sms" or "voice".
    pub async fn register(&self, phone: &str, method: &str) -> WlResult<()> {
        self.session.register(phone, method).await
    }

    /// Redeem a verification code for login credentials.
    pub async fn verify_code(&self, phone: &str, code: &str) -> WlResult<()> {
        self.session.verify_code(phone, code).await
    }

    /// Whether a valid session currently exists.
    pub async fn is_authenticated(&self) -> bool {
        self.session.is_authenticated().await
    }

    // --- connection lifecycle ---

    /// Open the persistent connection, logging in first when needed.
    pub async fn connect(&self) -> WlResult<()> {
        self.connection.connect().await
    }

    /// Close the connection and log out.
    pub async fn disconnect(&self) -> WlResult<()> {
        self.connection.disconnect().await;
        self.session.logout().await?;
        info!("client disconnected");
        Ok(())
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        self.connection.state().await
    }

    /// Subscribe to connection state changes.
    pub fn state_receiver(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.connection.state_receiver()
    }

    // --- sending ---

    /// Send a text message. Returns the message id.
    pub async fn send_text(
        &self,
        recipient: &str,
        body: &str,
        quoted_id: Option<&str>,
    ) -> WlResult<String> {
        let to = self.resolve(recipient)?;
        let frame = payload::text(&to, body, quoted_id);
        let id = frame_id(&frame);
        self.connection.send(frame).await?;
        Ok(id)
    }

    /// Upload a file and send it as a media message. Returns the message id.
    pub async fn send_media(
        &self,
        recipient: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> WlResult<String> {
        let to = self.resolve(recipient)?;
        let upload = self.media.upload(path).await?;
        let frame = payload::media(
            &to,
            &upload.url,
            &upload.mime_type,
            &upload.file_name,
            upload.file_size,
            caption,
        );
        let id = frame_id(&frame);
        self.connection.send(frame).await?;
        Ok(id)
    }

    /// Send a location share. Returns the message id.
    pub async fn send_location(
        &self,
        recipient: &str,
        latitude: f64,
        longitude: f64,
        name: Option<&str>,
    ) -> WlResult<String> {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(WlError::BadParam(format!(
                "coordinates out of range: {latitude}, {longitude}"
            )));
        }
        let to = self.resolve(recipient)?;
        let frame = payload::location(&to, latitude, longitude, name);
        let id = frame_id(&frame);
        self.connection.send(frame).await?;
        Ok(id)
    }

    /// Send a contact card. Returns the message id.
    pub async fn send_contact(
        &self,
        recipient: &str,
        contact_name: &str,
        vcard: &str,
    ) -> WlResult<String> {
        let to = self.resolve(recipient)?;
        let frame = payload::contact(&to, contact_name, vcard);
        let id = frame_id(&frame);
        self.connection.send(frame).await?;
        Ok(id)
    }

    /// Download a media blob referenced by an inbound media frame.
    pub async fn download_media(
        &self,
        url: &str,
        file_name: Option<&str>,
    ) -> WlResult<std::path::PathBuf> {
        self.media.download(url, file_name).await
    }

    // --- groups ---

    /// Create a group chat with the given subject and members.
    pub async fn create_group(&self, subject: &str, participants: &[&str]) -> WlResult<()> {
        let members = self.resolve_all(participants)?;
        self.connection
            .send(payload::group("create", None, Some(subject), &members))
            .await
    }

    /// Add members to a group.
    pub async fn add_participants(&self, group_id: &str, participants: &[&str]) -> WlResult<()> {
        let group = self.resolve_group(group_id)?;
        let members = self.resolve_all(participants)?;
        self.connection
            .send(payload::group("add", Some(&group), None, &members))
            .await
    }

    /// Remove members from a group.
    pub async fn remove_participants(
        &self,
        group_id: &str,
        participants: &[&str],
    ) -> WlResult<()> {
        let group = self.resolve_group(group_id)?;
        let members = self.resolve_all(participants)?;
        self.connection
            .send(payload::group("remove", Some(&group), None, &members))
            .await
    }

    /// Leave a group.
    pub async fn leave_group(&self, group_id: &str) -> WlResult<()> {
        let group = self.resolve_group(group_id)?;
        self.connection
            .send(payload::group("leave", Some(&group), None, &[]))
            .await
    }

    /// Change a group's subject.
    pub async fn set_group_subject(&self, group_id: &str, subject: &str) -> WlResult<()> {
        let group = self.resolve_group(group_id)?;
        self.connection
            .send(payload::group("subject", Some(&group), Some(subject), &[]))
            .await
    }

    // --- presence ---

    /// Broadcast a presence state ("available", "unavailable").
    pub async fn set_presence(&self, state: &str) -> WlResult<()> {
        self.connection.send(payload::presence_update(state, None)?).await
    }

    /// Send a chat state ("composing", "recording", "paused") to one chat.
    pub async fn send_chat_state(&self, recipient: &str, state: &str) -> WlResult<()> {
        let to = self.resolve(recipient)?;
        self.connection
            .send(payload::presence_update(state, Some(&to))?)
            .await
    }

    /// Convenience: show a typing indicator in one chat.
    pub async fn send_typing(&self, recipient: &str) -> WlResult<()> {
        self.send_chat_state(recipient, presence::TYPING).await
    }

    // --- subscriptions ---

    /// Subscribe to inbound messages; `frame_type` of `None` means all types.
    pub fn on_message<F>(&self, frame_type: Option<u32>, callback: F)
    where
        F: Fn(&Dispatch) + Send + 'static,
    {
        let key = frame_type.map(|code| code.to_string());
        self.connection
            .registry()
            .register(CallbackCategory::Message, key.as_deref(), callback);
    }

    /// Subscribe to inbound text messages only.
    pub fn on_text_message<F>(&self, callback: F)
    where
        F: Fn(&Dispatch) + Send + 'static,
    {
        self.on_message(Some(frame_types::TEXT), callback);
    }

    /// Subscribe to server events; `kind` of `None` means all events.
    pub fn on_event<F>(&self, kind: Option<&str>, callback: F)
    where
        F: Fn(&Dispatch) + Send + 'static,
    {
        self.connection
            .registry()
            .register(CallbackCategory::Event, kind, callback);
    }

    /// Subscribe to connection status changes.
    pub fn on_status<F>(&self, callback: F)
    where
        F: Fn(&Dispatch) + Send + 'static,
    {
        self.connection
            .registry()
            .register(CallbackCategory::Status, None, callback);
    }

    // --- recipient handling ---

    fn resolve(&self, recipient: &str) -> WlResult<String> {
        if recipient.contains('@') {
            return Ok(recipient.to_string());
        }
        if !jid::validate_phone_number(recipient) {
            return Err(WlError::BadParam(format!(
                "invalid phone number: {recipient}"
            )));
        }
        Ok(jid::resolve_recipient(recipient))
    }

    fn resolve_all(&self, recipients: &[&str]) -> WlResult<Vec<String>> {
        recipients.iter().map(|r| self.resolve(r)).collect()
    }

    fn resolve_group(&self, group_id: &str) -> WlResult<String> {
        if jid::is_group_jid(group_id) {
            Ok(group_id.to_string())
        } else if group_id.contains('@') {
            Err(WlError::BadParam(format!("not a group id: {group_id}")))
        } else {
            Ok(format!("{group_id}@{}", jid::GROUP_DOMAIN))
        }
    }
}

fn frame_id(frame: &wl_wire::frame::Frame) -> String {
    frame.data["id"].as_str().unwrap_or_default().to_string()
}
