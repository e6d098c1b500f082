use super::{ssml, Speech, SpeechBackend};
use crate::config_loader::AzureSayerSettings;
use crate::error::{Result, SayerError};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

const USER_AGENT: &str = concat!("sayerd/", env!("CARGO_PKG_VERSION"));
const SSML_CONTENT_TYPE: &str = "application/ssml+xml";
const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
const OUTPUT_FORMAT_HEADER: &str = "X-Microsoft-OutputFormat";

/// Azure Cognitive Services text-to-speech.
///
/// Each role maps to an SSML voice template. Credentials, region, formats and
/// the role table live behind one `RwLock` and are only ever replaced together.
pub struct AzureSayer {
    client: Client,
    state: RwLock<AzureState>,
}

#[derive(Debug, Clone)]
struct AzureState {
    speech_key: String,
    speech_region: String,
    /// role -> voice template
    roles: HashMap<String, String>,
    /// requested from Azure, e.g. "audio-16khz-32kbitrate-mono-mp3"
    format_microsoft: String,
    /// returned to callers, e.g. "mp3"
    format_mime_subtype: String,
    endpoint: String,
}

/// Everything one request needs, copied out so no lock is held during I/O.
#[derive(Debug, Clone, PartialEq)]
struct PreparedRequest {
    endpoint: String,
    speech_key: String,
    template: String,
    format_microsoft: String,
    format_mime_subtype: String,
}

impl AzureState {
    fn from_settings(settings: &AzureSayerSettings) -> Self {
        Self {
            speech_key: settings.speech_key.clone(),
            speech_region: settings.speech_region.clone(),
            roles: settings.roles.clone(),
            format_microsoft: settings.format_microsoft.clone(),
            format_mime_subtype: settings.format_mime_subtype.clone(),
            endpoint: settings.endpoint.clone(),
        }
    }

    fn endpoint(&self) -> String {
        if self.endpoint.is_empty() {
            format!(
                "https://{}.tts.speech.microsoft.com/cognitiveservices/v1",
                self.speech_region
            )
        } else {
            self.endpoint.clone()
        }
    }
}

impl AzureSayer {
    /// A sayer with mp3 output and no roles; add roles with `set_roles` before use.
    pub fn new(speech_key: &str, speech_region: &str) -> Result<Self> {
        Self::from_settings(&AzureSayerSettings {
            speech_key: speech_key.to_string(),
            speech_region: speech_region.to_string(),
            ..AzureSayerSettings::default()
        })
    }

    pub fn from_settings(settings: &AzureSayerSettings) -> Result<Self> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            client,
            state: RwLock::new(AzureState::from_settings(settings)),
        })
    }

    /// Swaps credentials, region, formats and roles in one step.
    pub fn reconfigure(&self, settings: &AzureSayerSettings) {
        let fresh = AzureState::from_settings(settings);
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = fresh;
    }

    /// Replaces the whole role table.
    pub fn set_roles(&self, roles: HashMap<String, String>) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).roles = roles;
    }

    /// Role names currently served, sorted.
    pub fn roles(&self) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut roles: Vec<String> = state.roles.keys().cloned().collect();
        roles.sort();
        roles
    }

    fn prepare(&self, role: &str) -> Result<PreparedRequest> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let template = state
            .roles
            .get(role)
            .ok_or_else(|| SayerError::UnknownRole(role.to_string()))?;

        Ok(PreparedRequest {
            endpoint: state.endpoint(),
            speech_key: state.speech_key.clone(),
            template: template.clone(),
            format_microsoft: state.format_microsoft.clone(),
            format_mime_subtype: state.format_mime_subtype.clone(),
        })
    }
}

#[async_trait]
impl SpeechBackend for AzureSayer {
    fn id(&self) -> &'static str {
        "azure"
    }

    async fn speak(&self, role: &str, text: &str) -> Result<Speech> {
        if text.trim().is_empty() {
            return Ok(Speech::empty());
        }

        let request = self.prepare(role)?;
        let body = ssml::render(&request.template, text)?;
        debug!(role, ssml = %body, "posting ssml to azure");

        let response = self
            .client
            .post(&request.endpoint)
            .header(SUBSCRIPTION_KEY_HEADER, &request.speech_key)
            .header(CONTENT_TYPE, SSML_CONTENT_TYPE)
            .header(OUTPUT_FORMAT_HEADER, &request.format_microsoft)
            .body(body)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(SayerError::Upstream {
                status: response.status().as_u16(),
            });
        }

        let audio = response.bytes().await?.to_vec();
        debug!(role, bytes = audio.len(), "azure synthesis done");
        Ok(Speech {
            format: request.format_mime_subtype,
            audio,
        })
    }

    async fn close(&self) {
        // the connection pool goes with the client when the last handle drops
        debug!("azure sayer closed");
    }
}
