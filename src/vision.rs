//! Chat-completions request construction and transport for vision models.

use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestMessageContentPartImageArgs,
    ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
    ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs, ImageUrlArgs,
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::capture::{FramePayload, FrameSet};
use crate::config::{CaptionSettings, EndpointConfig};
use crate::error::CaptionError;

const USER_INSTRUCTION: &str = "You are given a few frames sampled from a short video clip. \
Write a single caption that describes the clip as a whole.";
const TEMPERATURE: f32 = 0.2;

/// A chat-completions body plus the continuation flag understood by
/// llama.cpp-style servers.
///
/// With `add_generation_prompt == false` and an assistant message last, the
/// server extends that message instead of opening a new assistant turn.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct CaptionRequest {
    #[serde(flatten)]
    pub(crate) chat: CreateChatCompletionRequest,
    pub(crate) add_generation_prompt: bool,
}

/// Build the request for one clip.
///
/// A non-blank `prefill` is appended verbatim as a trailing assistant message.
pub(crate) fn build_request(
    frames: &[FramePayload],
    system_prompt: &str,
    model: &str,
    prefill: &str,
) -> Result<CaptionRequest, CaptionError> {
    let mut messages = vec![
        ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system_prompt.trim())
                .build()?,
        ),
        ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(ChatCompletionRequestUserMessageContent::Array(
                    [
                        vec![ChatCompletionRequestUserMessageContentPart::Text(
                            ChatCompletionRequestMessageContentPartTextArgs::default()
                                .text(USER_INSTRUCTION)
                                .build()?,
                        )],
                        frames
                            .iter()
                            .map(|frame| -> Result<_, OpenAIError> {
                                Ok(ChatCompletionRequestUserMessageContentPart::ImageUrl(
                                    ChatCompletionRequestMessageContentPartImageArgs::default()
                                        .image_url(
                                            ImageUrlArgs::default().url(frame.data_url()).build()?,
                                        )
                                        .build()?,
                                ))
                            })
                            .collect::<Result<_, _>>()?,
                    ]
                    .concat(),
                ))
                .build()?,
        ),
    ];

    let continue_prefill = !prefill.trim().is_empty();
    if continue_prefill {
        messages.push(ChatCompletionRequestMessage::Assistant(
            ChatCompletionRequestAssistantMessageArgs::default()
                .content(prefill)
                .build()?,
        ));
    }

    let chat = CreateChatCompletionRequestArgs::default()
        .model(model)
        .messages(messages)
        .temperature(TEMPERATURE)
        .build()?;

    Ok(CaptionRequest {
        chat,
        add_generation_prompt: !continue_prefill,
    })
}

/// Pull the caption out of a chat-completions response body.
///
/// Bodies without `choices[0].message.content` are returned pretty-printed
/// instead of failing, so a batch keeps going on an odd reply.
pub(crate) fn parse_caption(body: &Value) -> String {
    match body
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
    {
        Some(content) => content.trim().to_owned(),
        None => {
            warn!("response has no completion content, returning raw body");
            serde_json::to_string_pretty(body).unwrap_or_else(|_| body.to_string())
        }
    }
}

/// Turns sampled frames into a caption.
#[async_trait]
pub(crate) trait Captioner {
    async fn caption(
        &self,
        frames: &FrameSet,
        settings: &CaptionSettings,
    ) -> Result<String, CaptionError>;
}

/// HTTP client for an OpenAI-compatible chat-completions endpoint.
pub(crate) struct VisionClient {
    client: reqwest::Client,
    config: EndpointConfig,
}

impl VisionClient {
    pub(crate) fn new(config: EndpointConfig) -> Result<Self, CaptionError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    async fn send(&self, request: &CaptionRequest) -> Result<Value, CaptionError> {
        let url = self.config.chat_completions_url();
        debug!(
            %url,
            model = %request.chat.model,
            add_generation_prompt = request.add_generation_prompt,
            "sending caption request"
        );
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Captioner for VisionClient {
    async fn caption(
        &self,
        frames: &FrameSet,
        settings: &CaptionSettings,
    ) -> Result<String, CaptionError> {
        let model = self.config.resolve_model(&settings.model);
        let request = build_request(frames, &settings.system_prompt, model, &settings.prefill)?;
        let body = self.send(&request).await?;
        Ok(parse_caption(&body))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::sampling::{SamplingSpec, SamplingStrategy};

    fn frames() -> FrameSet {
        vec![
            FramePayload {
                mime: "image/jpeg",
                data: vec![0xFF, 0xD8, 0x01],
            },
            FramePayload {
                mime: "image/jpeg",
                data: vec![0xFF, 0xD8, 0x02],
            },
        ]
    }

    fn settings(model: &str, prefill: &str) -> CaptionSettings {
        CaptionSettings {
            system_prompt: "Caption this.".to_owned(),
            model: model.to_owned(),
            prefill: prefill.to_owned(),
            sampling: SamplingSpec::new(5, SamplingStrategy::Uniform),
        }
    }

    fn wire(request: &CaptionRequest) -> Value {
        serde_json::to_value(request).unwrap()
    }

    #[test]
    fn prefill_appends_assistant_turn() {
        let request = build_request(&frames(), "sys", "llava", "The video shows").unwrap();
        let body = wire(&request);

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        let last = messages.last().unwrap();
        assert_eq!(last["role"], "assistant");
        assert_eq!(last["content"], "The video shows");
        assert_eq!(body["add_generation_prompt"], false);
    }

    #[test]
    fn blank_prefill_starts_fresh_turn() {
        for prefill in ["", "   ", "\n\t"] {
            let request = build_request(&frames(), "sys", "llava", prefill).unwrap();
            let body = wire(&request);

            let messages = body["messages"].as_array().unwrap();
            assert_eq!(messages.len(), 2);
            assert_eq!(messages[1]["role"], "user");
            assert_eq!(body["add_generation_prompt"], true);
        }
    }

    #[test]
    fn prefill_is_sent_verbatim() {
        let request = build_request(&frames(), "sys", "llava", "  A dog ").unwrap();
        let body = wire(&request);

        assert_eq!(body["messages"][2]["content"], "  A dog ");
    }

    #[test]
    fn request_carries_prompt_instruction_and_frames_in_order() {
        let frames = frames();
        let request = build_request(&frames, "  You caption videos.\n", "llava", "").unwrap();
        let body = wire(&request);

        assert_eq!(body["model"], "llava");
        assert!((body["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);

        let system = &body["messages"][0];
        assert_eq!(system["role"], "system");
        assert_eq!(system["content"], "You caption videos.");

        let content = body["messages"][1]["content"].as_array().unwrap();
        assert_eq!(content.len(), 3);
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[0]["text"], USER_INSTRUCTION);
        for (part, frame) in content[1..].iter().zip(&frames) {
            assert_eq!(part["type"], "image_url");
            assert_eq!(part["image_url"]["url"], frame.data_url());
        }
    }

    #[test]
    fn parses_first_choice_content() {
        let body = json!({
            "choices": [
                { "message": { "role": "assistant", "content": "  A cat jumps.\n" } },
                { "message": { "role": "assistant", "content": "ignored" } }
            ]
        });
        assert_eq!(parse_caption(&body), "A cat jumps.");
    }

    #[test]
    fn malformed_response_is_dumped_not_failed() {
        let body = json!({ "error": { "message": "model not loaded" } });
        let caption = parse_caption(&body);

        assert_eq!(caption, serde_json::to_string_pretty(&body).unwrap());
        assert!(caption.contains("model not loaded"));
        assert!(caption.contains("\n  \"error\""));
    }

    /// Accept one connection, reply with `status` and `body`, and hand back
    /// the JSON request body that was received.
    async fn serve_once(status: &'static str, body: String) -> (String, JoinHandle<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut chunk = [0u8; 8192];
            let request_body = loop {
                let read = socket.read(&mut chunk).await.unwrap();
                assert!(read > 0, "client closed before sending a full request");
                received.extend_from_slice(&chunk[..read]);
                let Some(end) = received.windows(4).position(|w| w == b"\r\n\r\n") else {
                    continue;
                };
                let headers = String::from_utf8_lossy(&received[..end]).to_lowercase();
                let length = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                let start = end + 4;
                if received.len() >= start + length {
                    break received[start..start + length].to_vec();
                }
            };
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            serde_json::from_slice(&request_body).unwrap()
        });
        (format!("http://{address}/v1"), handle)
    }

    fn client(base_url: String) -> VisionClient {
        VisionClient::new(EndpointConfig {
            base_url,
            default_model: "default-vl".to_owned(),
            timeout: Duration::from_secs(10),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn captions_through_endpoint_with_default_model() {
        let reply = json!({ "choices": [{ "message": { "content": " walking slowly.\n" } }] });
        let (base_url, server) = serve_once("200 OK", reply.to_string()).await;

        let caption = client(base_url)
            .caption(&frames(), &settings("", "The video shows"))
            .await
            .unwrap();
        let sent = server.await.unwrap();

        assert_eq!(caption, "walking slowly.");
        assert_eq!(sent["model"], "default-vl");
        assert_eq!(sent["add_generation_prompt"], false);
        assert_eq!(sent["messages"][2]["role"], "assistant");
    }

    #[tokio::test]
    async fn error_status_is_endpoint_error() {
        let (base_url, server) =
            serve_once("500 Internal Server Error", "{\"error\":\"boom\"}".to_owned()).await;

        let result = client(base_url)
            .caption(&frames(), &settings("llava", ""))
            .await;
        server.await.unwrap();

        assert!(matches!(result, Err(CaptionError::Endpoint(_))));
    }

    #[tokio::test]
    async fn connection_refused_is_endpoint_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let result = client(format!("http://{address}/v1"))
            .caption(&frames(), &settings("llava", ""))
            .await;

        assert!(matches!(result, Err(CaptionError::Endpoint(_))));
    }
}
