// REST client for the chat endpoints.

use async_trait::async_trait;
use log::{debug, error, info};
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use url::Url;

use super::compose::StagedAttachment;
use crate::error::{ChatError, Result};
use crate::models::wire::{ChatDto, LoginResponse, MessageDto, PageEnvelope};
use crate::models::{Conversation, Message, Page};
use crate::session::Session;

/// The three chat calls the synchronizers depend on
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// `GET /chats?page=&search=`
    async fn list_chats(&self, page: u32, search: &str) -> Result<Page<Conversation>>;

    /// `GET /chats/{id}/messages?page=&limit=`, newest first
    async fn list_messages(&self, chat_id: &str, page: u32, limit: u32) -> Result<Page<Message>>;

    /// `POST /chats/{id}/messages` as multipart: a `message` field plus one `files` part per attachment
    async fn send_message(&self, chat_id: &str, text: &str, files: &[StagedAttachment]) -> Result<Message>;
}

#[derive(Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    base: Url,
    session: Session,
}

impl HttpBackend {
    pub fn new(base_url: &str, session: Session) -> Result<Self> {
        Ok(HttpBackend {
            http: reqwest::Client::new(),
            base: Url::parse(base_url)?,
            session,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Exchange credentials for a session via `POST /auth/login`
    pub async fn login(base_url: &str, email: &str, password: &str) -> Result<Session> {
        let url = endpoint(&Url::parse(base_url)?, &["auth", "login"])?;
        info!("Logging in as {}", email);
        let response = reqwest::Client::new()
            .post(url)
            .json(&json!({"email": email, "password": password}))
            .send()
            .await?;
        let login: LoginResponse = decode(response).await?;
        let name = login.user.name.unwrap_or_else(|| email.to_string());
        Ok(Session::new(&login.token, &login.user.id, &name))
    }
}

fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| ChatError::Config(format!("{} cannot be a base URL", base)))?;
        path.pop_if_empty();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        error!("Request failed with {}: {}", status, body);
        return Err(ChatError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(serde_json::from_str(&body)?)
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn list_chats(&self, page: u32, search: &str) -> Result<Page<Conversation>> {
        let mut url = endpoint(&self.base, &["chats"])?;
        url.query_pairs_mut().append_pair("page", &page.to_string());
        if !search.trim().is_empty() {
            url.query_pairs_mut().append_pair("search", search.trim());
        }
        debug!("GET {}", url);

        let response = self
            .http
            .get(url)
            .bearer_auth(self.session.token())
            .send()
            .await?;
        let envelope: PageEnvelope<ChatDto> = decode(response).await?;
        Ok(envelope.into_page(ChatDto::into_conversation))
    }

    async fn list_messages(&self, chat_id: &str, page: u32, limit: u32) -> Result<Page<Message>> {
        let mut url = endpoint(&self.base, &["chats", chat_id, "messages"])?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("limit", &limit.to_string());
        debug!("GET {}", url);

        let response = self
            .http
            .get(url)
            .bearer_auth(self.session.token())
            .send()
            .await?;
        let envelope: PageEnvelope<MessageDto> = decode(response).await?;
        let viewer = self.session.user_id();
        Ok(envelope.into_page(|dto| dto.into_message(viewer, chat_id)))
    }

    async fn send_message(&self, chat_id: &str, text: &str, files: &[StagedAttachment]) -> Result<Message> {
        let url = endpoint(&self.base, &["chats", chat_id, "messages"])?;
        let mut form = Form::new().text("message", text.to_string());
        for file in files {
            let bytes = tokio::fs::read(&file.path).await?;
            let part = Part::bytes(bytes)
                .file_name(file.filename.clone())
                .mime_str(&file.mime)?;
            form = form.part("files", part);
        }
        info!("POST {} ({} attachments)", url, files.len());

        let response = self
            .http
            .post(url)
            .bearer_auth(self.session.token())
            .multipart(form)
            .send()
            .await?;
        // either {"data": {...}} or the bare message
        let body: Value = decode(response).await?;
        let payload = match body.get("data") {
            Some(data) if data.is_object() => data.clone(),
            _ => body,
        };
        let dto: MessageDto = serde_json::from_value(payload)?;
        Ok(dto.into_message(self.session.user_id(), chat_id))
    }
}
