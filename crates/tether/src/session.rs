//! Session: a remote browser session driven over the bridge.
//!
//! One method per remote operation. Each method checks that the session is
//! still alive, sends its command, and waits for the matching response event
//! addressed to this session.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dispatcher::{HandlerError, HandlerResult, ListenerAction, ListenerHandle};
use crate::error::BridgeError;
use crate::identifier::Identifier;
use crate::object::Object;
use crate::wire::Event;

pub const CMD_CLEAR_CACHE: &str = "session.cmd.clear.cache";
pub const EVENT_CLEARED_CACHE: &str = "session.event.cleared.cache";
pub const CMD_FLUSH_STORAGE: &str = "session.cmd.flush.storage";
pub const EVENT_FLUSHED_STORAGE: &str = "session.event.flushed.storage";
pub const CMD_LOAD_EXTENSION: &str = "session.cmd.load.extension";
pub const EVENT_LOADED_EXTENSION: &str = "session.event.loaded.extension";
pub const EVENT_WILL_DOWNLOAD: &str = "session.event.will.download";
pub const CMD_SET_COOKIES: &str = "session.cmd.cookies.set";
pub const EVENT_SET_COOKIES: &str = "session.event.cookies.set";
pub const CMD_GET_COOKIES: &str = "session.cmd.cookies.get";
pub const EVENT_GET_COOKIES: &str = "session.event.cookies.get";
pub const CMD_FROM_PARTITION: &str = "session.cmd.from.partition";
pub const EVENT_FROM_PARTITION: &str = "session.event.from.partition";
pub const CMD_SET_USER_AGENT: &str = "session.cmd.set.user.agent";
pub const EVENT_SET_USER_AGENT: &str = "session.event.set.user.agent";
pub const CMD_CLOSE_ALL_CONNECTIONS: &str = "session.cmd.close.all.connections";
pub const EVENT_CLOSE_ALL_CONNECTIONS: &str = "session.event.close.all.connections";
pub const CMD_SET_PROXY: &str = "session.cmd.set.proxy";
pub const EVENT_SET_PROXY: &str = "session.event.set.proxy";
pub const CMD_WEB_REQUEST_ON_BEFORE_REQUEST: &str = "session.cmd.web.request.on.before.request";
pub const EVENT_WEB_REQUEST_ON_BEFORE_REQUEST: &str = "session.event.web.request.on.before.request";
pub const EVENT_WEB_REQUEST_ON_BEFORE_REQUEST_CALLBACK: &str =
    "session.event.web.request.on.before.request.callback";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{operation} failed: {source}")]
    Operation {
        operation: &'static str,
        source: BridgeError,
    },
    #[error("{operation} failed: could not encode command: {source}")]
    Encode {
        operation: &'static str,
        source: serde_json::Error,
    },
    #[error("{operation} failed: invalid response payload: {source}")]
    Decode {
        operation: &'static str,
        source: serde_json::Error,
    },
}

impl SessionError {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Operation { operation, .. }
            | Self::Encode { operation, .. }
            | Self::Decode { operation, .. } => operation,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Operation { source, .. } if source.is_cancelled())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCookie {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<bool>,
    /// Seconds since the UNIX epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyOptions {
    #[serde(rename = "pacScript", default, skip_serializing_if = "Option::is_none")]
    pub pac_script: Option<String>,
    #[serde(rename = "proxyRules", default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<String>,
    #[serde(rename = "proxyBypassRules", default, skip_serializing_if = "Option::is_none")]
    pub bypass_rules: Option<String>,
}

/// URL patterns a web-request subscription applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOptions {
    pub urls: Vec<String>,
}

/// Answer to one intercepted request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeforeRequestDecision {
    pub cancel: bool,
    pub redirect_url: Option<String>,
    /// Whether the subscription stays registered after this request.
    pub action: ListenerAction,
}

impl BeforeRequestDecision {
    pub fn proceed() -> Self {
        Self::default()
    }

    pub fn cancel() -> Self {
        Self {
            cancel: true,
            ..Self::default()
        }
    }

    pub fn redirect(url: impl Into<String>) -> Self {
        Self {
            redirect_url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn and_unsubscribe(mut self) -> Self {
        self.action = ListenerAction::Remove;
        self
    }
}

pub struct Session {
    object: Object,
}

impl Session {
    pub fn new(object: Object) -> Self {
        Self { object }
    }

    pub fn id(&self) -> &Identifier {
        self.object.id()
    }

    pub fn object(&self) -> &Object {
        &self.object
    }

    pub fn is_closed(&self) -> bool {
        self.object.is_cancelled()
    }

    pub fn close(&self) {
        self.object.close();
    }

    fn command(&self, name: &str) -> Event {
        Event::new(name).with_target(self.id().clone())
    }

    async fn request(
        &self,
        operation: &'static str,
        command: Event,
        expected: &str,
    ) -> Result<Event, SessionError> {
        let fail = |source| SessionError::Operation { operation, source };
        self.object.ensure_alive().map_err(fail)?;
        self.object
            .call_targeted(command, expected)
            .await
            .map_err(fail)
    }

    fn encode_error(operation: &'static str) -> impl Fn(serde_json::Error) -> SessionError {
        move |source| SessionError::Encode { operation, source }
    }

    fn decode_error(operation: &'static str) -> impl Fn(serde_json::Error) -> SessionError {
        move |source| SessionError::Decode { operation, source }
    }

    /// Clear the session's HTTP cache.
    pub async fn clear_cache(&self) -> Result<(), SessionError> {
        self.request("clear cache", self.command(CMD_CLEAR_CACHE), EVENT_CLEARED_CACHE)
            .await?;
        Ok(())
    }

    /// Write any unwritten DOM storage data to disk.
    pub async fn flush_storage(&self) -> Result<(), SessionError> {
        self.request(
            "flush storage",
            self.command(CMD_FLUSH_STORAGE),
            EVENT_FLUSHED_STORAGE,
        )
        .await?;
        Ok(())
    }

    /// Load an unpacked browser extension from `path`.
    pub async fn load_extension(&self, path: impl Into<String>) -> Result<(), SessionError> {
        let command = self
            .command(CMD_LOAD_EXTENSION)
            .with_field("path", Into::<String>::into(path));
        self.request("load extension", command, EVENT_LOADED_EXTENSION)
            .await?;
        Ok(())
    }

    pub async fn set_cookies(&self, cookies: &[SessionCookie]) -> Result<(), SessionError> {
        const OPERATION: &str = "set cookies";
        let command = self
            .command(CMD_SET_COOKIES)
            .try_with_field("cookies", cookies)
            .map_err(Self::encode_error(OPERATION))?;
        self.request(OPERATION, command, EVENT_SET_COOKIES).await?;
        Ok(())
    }

    /// Fetch every cookie in the session. A response without a `cookies`
    /// field means there are none.
    pub async fn get_cookies(&self) -> Result<Vec<SessionCookie>, SessionError> {
        const OPERATION: &str = "get cookies";
        let response = self
            .request(OPERATION, self.command(CMD_GET_COOKIES), EVENT_GET_COOKIES)
            .await?;
        match response.field("cookies") {
            None | Some(serde_json::Value::Null) => Ok(Vec::new()),
            Some(_) => response
                .decode_field("cookies")
                .map_err(Self::decode_error(OPERATION)),
        }
    }

    /// Rebind this session to the remote session for `partition`.
    ///
    /// The command carries the id as `sessionId` rather than `targetID`, so the
    /// response is matched by name only.
    pub async fn from_partition(&self, partition: impl Into<String>) -> Result<(), SessionError> {
        const OPERATION: &str = "from partition";
        let fail = |source| SessionError::Operation {
            operation: OPERATION,
            source,
        };
        self.object.ensure_alive().map_err(fail)?;
        let command = Event::new(CMD_FROM_PARTITION)
            .with_field("sessionId", self.id().as_str())
            .with_field("partition", Into::<String>::into(partition));
        self.object
            .call(command, EVENT_FROM_PARTITION)
            .await
            .map_err(fail)?;
        Ok(())
    }

    pub async fn set_user_agent(
        &self,
        user_agent: impl Into<String>,
        accept_languages: impl Into<String>,
    ) -> Result<(), SessionError> {
        let command = self
            .command(CMD_SET_USER_AGENT)
            .with_field("userAgent", Into::<String>::into(user_agent))
            .with_field("acceptLanguages", Into::<String>::into(accept_languages));
        self.request("set user agent", command, EVENT_SET_USER_AGENT)
            .await?;
        Ok(())
    }

    pub async fn close_all_connections(&self) -> Result<(), SessionError> {
        self.request(
            "close all connections",
            self.command(CMD_CLOSE_ALL_CONNECTIONS),
            EVENT_CLOSE_ALL_CONNECTIONS,
        )
        .await?;
        Ok(())
    }

    pub async fn set_proxy(&self, proxy: &ProxyOptions) -> Result<(), SessionError> {
        const OPERATION: &str = "set proxy";
        let command = self
            .command(CMD_SET_PROXY)
            .try_with_field("proxy", proxy)
            .map_err(Self::encode_error(OPERATION))?;
        self.request(OPERATION, command, EVENT_SET_PROXY).await?;
        Ok(())
    }

    /// Subscribe to downloads started in this session.
    pub fn on_will_download<F>(&self, handler: F) -> ListenerHandle
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.object.on_targeted(EVENT_WILL_DOWNLOAD, handler)
    }

    /// Intercept requests matching `filter` before they are sent.
    ///
    /// `handler` runs on the dispatch path once per intercepted request. Its
    /// decision is queued as a reply carrying the request's `callbackId`, so the
    /// runtime can match concurrent interceptions. A reply that cannot be queued
    /// is logged and reported as a handler failure.
    pub async fn on_before_request<F>(
        &self,
        filter: FilterOptions,
        handler: F,
    ) -> Result<ListenerHandle, SessionError>
    where
        F: Fn(&Event) -> BeforeRequestDecision + Send + Sync + 'static,
    {
        const OPERATION: &str = "subscribe to before-request";
        let fail = |source| SessionError::Operation {
            operation: OPERATION,
            source,
        };
        self.object.ensure_alive().map_err(fail)?;

        let command = self
            .command(CMD_WEB_REQUEST_ON_BEFORE_REQUEST)
            .try_with_field("filter", &filter)
            .map_err(Self::encode_error(OPERATION))?;

        let writer = Arc::clone(self.object.writer());
        let id = self.id().clone();
        let handle = self
            .object
            .on_targeted(EVENT_WEB_REQUEST_ON_BEFORE_REQUEST, move |event| {
                let Some(callback_id) = event.callback_id.clone() else {
                    return Err(HandlerError::msg(
                        "before-request event carries no callbackId",
                    ));
                };

                let decision = handler(event);
                let mut reply = Event::new(EVENT_WEB_REQUEST_ON_BEFORE_REQUEST_CALLBACK)
                    .with_target(id.clone())
                    .with_callback(callback_id.clone())
                    .with_field("cancel", decision.cancel);
                if let Some(url) = decision.redirect_url {
                    reply = reply.with_field("redirectURL", url);
                }

                if let Err(e) = writer.send(reply) {
                    tracing::warn!(
                        session = %id,
                        %callback_id,
                        error = %e,
                        "Failed to send before-request reply"
                    );
                    return Err(e.into());
                }
                Ok(decision.action)
            });

        if let Err(e) = self.object.write(command).await {
            self.object
                .off(EVENT_WEB_REQUEST_ON_BEFORE_REQUEST, handle);
            return Err(fail(e));
        }
        Ok(handle)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
