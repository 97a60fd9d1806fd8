//! Report-card prompt synthesis and image generation.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use shared_types::{CodeSnippet, ProfileResult, Repository};

use crate::durable::ActivityError;

use super::{status_error, transport_error};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const CULTURAL_CONTEXT: &str = "\
Based on their profile, create a visual that puts them in modern cultural context. For example:
- If they're a high-achiever: \"Three Dragons\" meme (the one who's clearly the best)
- If they're average: Bell curve meme (sitting comfortably in the middle)
- If they're struggling: \"This is fine\" dog meme
- If they're a language polyglot: \"I know 20 languages\" flex meme
- If they're a minimalist: \"Less is more\" aesthetic meme
- If they're a documentation enthusiast: \"Read the docs\" energy meme
";

/// Build the report-card prompt that grounds a profile in cultural context.
pub fn build_report_card_prompt(profile: &ProfileResult, system_prompt: &str) -> String {
    format!(
        "{system_prompt}
**Developer Report Card:**
- Username: {username}
- Bio: {bio}
- Location: {location}
- Languages: {languages}
- Public Repos: {public} (Original: {original}, Forked: {forked})
- Professional Score: {score:.1}/10

**Top Repositories:**
{repos}

**Code Style Indicators:**
{snippets}

**Professional Assessment:**
- Safety Flags: {flags}
- Contribution Activity: {total} total contributions, {streak} day streak

**Cultural Context Instructions:**
{CULTURAL_CONTEXT}",
        username = profile.username,
        bio = profile.bio,
        location = profile.location,
        languages = profile.languages.join(", "),
        public = profile.public_repos,
        original = profile.original_repos,
        forked = profile.forked_repos,
        score = profile.professional_score,
        repos = format_repositories(&profile.top_repositories),
        snippets = format_code_snippets(&profile.code_snippets),
        flags = profile.safety_flags.join(", "),
        total = profile.contribution_graph.total_contributions,
        streak = profile.contribution_graph.streak,
    )
}

fn format_repositories(repos: &[Repository]) -> String {
    repos
        .iter()
        .map(|r| {
            format!(
                "- {} ({}): {} - {} stars",
                r.name, r.language, r.description, r.stars
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_code_snippets(snippets: &[CodeSnippet]) -> String {
    snippets
        .iter()
        .map(|s| {
            format!(
                "- {}/{} ({}): {}",
                s.repository, s.file_path, s.language, s.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ============================================================================
// Image generation
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub data: Vec<u8>,
    /// MIME type, e.g. `image/png`
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageSpec {
    pub model: String,
    pub format: String,
    pub width: u32,
    pub height: u32,
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, spec: &ImageSpec) -> Result<GeneratedImage, ActivityError>;
}

/// Gemini `generateContent` over REST; the first inline image part wins.
#[derive(Debug, Clone)]
pub struct GeminiImageClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeminiImageClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ActivityError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .map_err(|e| ActivityError::non_retryable("HttpClientError", e.to_string()))?;
        Ok(Self {
            http,
            base_url: GEMINI_BASE_URL.to_string(),
            api_key: api_key.into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl ImageGenerator for GeminiImageClient {
    async fn generate(&self, prompt: &str, spec: &ImageSpec) -> Result<GeneratedImage, ActivityError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, spec.model
        );
        let body = json!({ "contents": [{ "parts": [{ "text": prompt }] }] });

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("generateContent", e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error("generateContent", e))?;
        if !status.is_success() {
            return Err(status_error("generateContent", status, &text));
        }

        let image = parse_inline_image(&text)?;
        tracing::info!(
            model = %spec.model,
            bytes = image.data.len(),
            content_type = %image.content_type,
            "Image generated"
        );
        Ok(image)
    }
}

/// Pull the first `inlineData` part out of a `generateContent` response.
pub fn parse_inline_image(body: &str) -> Result<GeneratedImage, ActivityError> {
    let root: Value = serde_json::from_str(body).map_err(|e| {
        ActivityError::non_retryable(
            "ResponseDecodeError",
            format!("failed to decode generateContent body: {e}"),
        )
    })?;

    let parts = root
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .filter(|parts| !parts.is_empty())
        .ok_or_else(|| {
            ActivityError::non_retryable("NoContent", "no content returned from API")
        })?;

    let inline = parts
        .iter()
        .find_map(|part| part.get("inlineData").or_else(|| part.get("inline_data")))
        .ok_or_else(|| ActivityError::non_retryable("NoImageData", "no image data returned"))?;

    let encoded = inline
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| ActivityError::non_retryable("NoImageData", "no image data returned"))?;
    let data = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| {
            ActivityError::non_retryable("ResponseDecodeError", format!("invalid image data: {e}"))
        })?;
    let content_type = inline
        .get("mimeType")
        .or_else(|| inline.get("mime_type"))
        .and_then(Value::as_str)
        .unwrap_or("image/png")
        .to_string();

    Ok(GeneratedImage { data, content_type })
}
