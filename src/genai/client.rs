//! Streaming client for the Vertex AI Gemini API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use tracing::{debug, info};

use crate::config::{GenerationSettings, UpstreamConfig};
use crate::error::GenAiError;
use crate::genai::auth::{Credentials, TokenProvider};
use crate::genai::sse::SseDecoder;
use crate::genai::types::{
    Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig,
};

/// Lazy, finite sequence of response chunks from one generation call.
pub type ChunkStream = BoxStream<'static, Result<GenerateContentResponse, GenAiError>>;

/// A hosted model that can stream a generation.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    /// Model identifier, for logging and health output.
    fn model_id(&self) -> &str;

    /// Start a streaming generation.
    ///
    /// Errors that happen before the first chunk (connection, credentials,
    /// non-success status) are returned directly; later failures surface as
    /// an `Err` item in the stream.
    async fn stream_generate(
        &self,
        request: GenerateContentRequest,
    ) -> Result<ChunkStream, GenAiError>;
}

/// Build the single-turn request for a user query.
pub fn build_request(query: &str, settings: &GenerationSettings) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: vec![Content::user(query)],
        system_instruction: Some(Content::system(settings.system_instruction.clone())),
        generation_config: Some(GenerationConfig {
            temperature: Some(settings.temperature),
            max_output_tokens: Some(settings.max_output_tokens),
        }),
        safety_settings: Some(settings.safety_settings.clone()),
    }
}

/// [`GenerativeModel`] backed by the Vertex AI `streamGenerateContent` endpoint.
#[derive(Debug, Clone)]
pub struct VertexClient {
    http: reqwest::Client,
    tokens: Arc<TokenProvider>,
    endpoint: String,
    model: String,
}

impl VertexClient {
    /// Build a client from upstream settings. Environment fallbacks are
    /// expected to have been applied already.
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, GenAiError> {
        let credentials = resolve_credentials(config)?;

        let project = config
            .project
            .clone()
            .or_else(|| credentials.project_id().map(str::to_string))
            .ok_or_else(|| {
                GenAiError::Auth("no project: set upstream.project or GOOGLE_CLOUD_PROJECT".into())
            })?;

        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs));
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let http = builder.build()?;

        let endpoint = format!(
            "{}/v1/projects/{project}/locations/{}/publishers/google/models/{}:streamGenerateContent?alt=sse",
            config.resolved_base_url(),
            config.location,
            config.model,
        );

        info!(project, location = config.location, model = config.model, "Vertex AI client ready");

        Ok(Self {
            http,
            tokens: Arc::new(TokenProvider::new(credentials)),
            endpoint,
            model: config.model.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn headers(&self) -> Result<HeaderMap, GenAiError> {
        let token = self.tokens.bearer_token(&self.http).await?;
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| GenAiError::Auth(format!("unusable access token: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

/// Pick the credential source: static token, then credentials file, then
/// the metadata server.
fn resolve_credentials(config: &UpstreamConfig) -> Result<Credentials, GenAiError> {
    let credentials = match (&config.access_token, &config.credentials_path) {
        (Some(token), _) => Credentials::AccessToken(token.clone()),
        (None, Some(path)) => Credentials::from_file(path)?,
        (None, None) => Credentials::Metadata {
            host: config.metadata_host.clone(),
        },
    };
    let source = match &credentials {
        Credentials::AccessToken(_) => "access_token",
        Credentials::ServiceAccount(_) => "service_account",
        Credentials::AuthorizedUser(_) => "authorized_user",
        Credentials::Metadata { .. } => "metadata_server",
    };
    debug!(source, "Resolved upstream credentials");
    Ok(credentials)
}

#[async_trait]
impl GenerativeModel for VertexClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn stream_generate(
        &self,
        request: GenerateContentRequest,
    ) -> Result<ChunkStream, GenAiError> {
        let headers = self.headers().await?;
        let response = self
            .http
            .post(&self.endpoint)
            .headers(headers)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenAiError::Status { status, body });
        }

        debug!(model = self.model, "Upstream stream opened");
        Ok(decode_sse(response.bytes_stream()))
    }
}

/// Turn an SSE byte stream into decoded response chunks.
///
/// After the first error the stream ends.
pub fn decode_sse<S, E>(body: S) -> ChunkStream
where
    S: futures::Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<GenAiError>,
{
    let body: BoxStream<'static, Result<Bytes, GenAiError>> =
        body.map(|item| item.map_err(Into::into)).boxed();

    stream::unfold(
        (body, SseDecoder::new(), false),
        |(mut body, mut decoder, done)| async move {
            if done {
                return None;
            }
            let (batch, done): (Vec<Result<GenerateContentResponse, GenAiError>>, bool) =
                match body.next().await {
                    Some(Ok(bytes)) => {
                        (decoder.push(&bytes).into_iter().map(parse_event).collect(), false)
                    }
                    Some(Err(e)) => (vec![Err(e)], true),
                    None => (decoder.finish().into_iter().map(parse_event).collect(), true),
                };
            Some((stream::iter(batch), (body, decoder, done)))
        },
    )
    .flatten()
    .scan(false, |failed, item| {
        if *failed {
            return futures::future::ready(None);
        }
        *failed = item.is_err();
        futures::future::ready(Some(item))
    })
    .boxed()
}

/// Decode one event. An `error` object sent in-band after the 200 is an
/// upstream failure, not an empty chunk.
fn parse_event(data: String) -> Result<GenerateContentResponse, GenAiError> {
    let mut chunk: GenerateContentResponse = serde_json::from_str(&data)?;
    match chunk.error.take() {
        Some(error) => Err(GenAiError::Upstream {
            code: error.code.unwrap_or_default(),
            status: error.status.unwrap_or_default(),
            message: error.message,
        }),
        None => Ok(chunk),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_build_request_uses_settings() {
        let settings = GenerationSettings::default();
        let request = build_request("best travel card?", &settings);

        assert_eq!(request.contents, vec![Content::user("best travel card?")]);
        assert_eq!(
            request.system_instruction,
            Some(Content::system(crate::config::DEFAULT_SYSTEM_INSTRUCTION))
        );
        let generation = request.generation_config.unwrap();
        assert_eq!(generation.temperature, Some(0.7));
        assert_eq!(generation.max_output_tokens, Some(256));
        assert_eq!(request.safety_settings.unwrap().len(), 4);
    }

    #[test]
    fn test_endpoint_for_global_location() {
        let mut upstream = Config::default().upstream;
        upstream.project = Some("demo-project".to_string());
        upstream.access_token = Some("token".to_string());

        let client = VertexClient::from_config(&upstream).unwrap();
        assert_eq!(
            client.endpoint(),
            "https://aiplatform.googleapis.com/v1/projects/demo-project/locations/global/publishers/google/models/gemini-2.5-flash:streamGenerateContent?alt=sse"
        );
        assert_eq!(client.model_id(), "gemini-2.5-flash");
    }

    #[test]
    fn test_credentials_fall_back_to_metadata_server() {
        let mut upstream = Config::default().upstream;
        upstream.project = Some("demo-project".to_string());
        upstream.metadata_host = "127.0.0.1:8080".to_string();

        match resolve_credentials(&upstream).unwrap() {
            Credentials::Metadata { host } => assert_eq!(host, "127.0.0.1:8080"),
            other => panic!("unexpected credentials: {other:?}"),
        }
        assert!(VertexClient::from_config(&upstream).is_ok());
    }

    #[test]
    fn test_unreadable_credentials_file_rejected() {
        let mut upstream = Config::default().upstream;
        upstream.project = Some("demo-project".to_string());
        upstream.credentials_path = Some("/nonexistent/key.json".into());
        let err = VertexClient::from_config(&upstream).unwrap_err();
        assert!(matches!(err, GenAiError::Auth(_)));
    }

    #[test]
    fn test_project_required_without_key_project() {
        let upstream = Config::default().upstream;
        let err = VertexClient::from_config(&upstream).unwrap_err();
        assert!(err.to_string().contains("no project"), "{err}");
    }

    #[tokio::test]
    async fn test_decode_sse_stops_after_bad_chunk() {
        let body = stream::iter(vec![
            Ok::<_, GenAiError>(Bytes::from_static(
                b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi\"}]}}]}\n\n",
            )),
            Ok(Bytes::from_static(b"data: not json\n\ndata: {}\n\n")),
        ]);

        let items: Vec<_> = decode_sse(body).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().text().as_deref(), Some("Hi"));
        assert!(matches!(items[1], Err(GenAiError::Decode(_))));
    }

    #[tokio::test]
    async fn test_in_band_error_event_reaches_client() {
        let body = stream::iter(vec![
            Ok::<_, GenAiError>(Bytes::from_static(
                b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hello\"}]}}]}\n\n",
            )),
            Ok(Bytes::from_static(
                b"data: {\"error\":{\"code\":503,\"message\":\"The model is overloaded.\",\"status\":\"UNAVAILABLE\"}}\n\n",
            )),
        ]);

        let items: Vec<_> = decode_sse(body).collect().await;
        assert_eq!(items.len(), 2);
        match &items[1] {
            Err(GenAiError::Upstream { code, status, message }) => {
                assert_eq!(*code, 503);
                assert_eq!(status, "UNAVAILABLE");
                assert_eq!(message, "The model is overloaded.");
            }
            other => panic!("unexpected item: {other:?}"),
        }

        let relayed: Vec<_> = crate::server::streaming::chunks_to_text_stream(
            decode_sse(stream::iter(vec![Ok::<_, GenAiError>(Bytes::from_static(
                b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hello\"}]}}]}\n\ndata: {\"error\":{\"code\":503,\"message\":\"The model is overloaded.\",\"status\":\"UNAVAILABLE\"}}\n\n",
            ))])),
            "test".to_string(),
        )
        .collect()
        .await;
        let text: String = relayed
            .into_iter()
            .map(|frame| String::from_utf8(frame.unwrap().to_vec()).unwrap())
            .collect();
        assert!(text.starts_with("Hello ❗ Server error: "), "{text}");
        assert!(text.contains("The model is overloaded."), "{text}");
    }
}
