// src/advisor.rs - Fit advisor backed by a hosted language model
//
// The model is prompted with the pose landmarks and the current transform
// and asked for a JSON object matching the response schema below. Anything
// that does not parse, or that parses into invalid parameters, is a
// validation failure.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::AdvisorError;
use crate::model::{AdjustmentRequest, AdjustmentResponse};
use crate::pose::PoseSummary;

/// Proposes new model parameters for the current pose.
#[async_trait]
pub trait FitAdvisor: Send + Sync + 'static {
    async fn improve_fit(
        &self,
        request: &AdjustmentRequest,
    ) -> Result<AdjustmentResponse, AdvisorError>;
}

/// Render the advisor prompt for one request.
pub fn build_prompt(request: &AdjustmentRequest) -> String {
    let mut prompt = String::with_capacity(4096);
    let p = &request.current_parameters;

    prompt.push_str(
        "You adjust a 3D clothing model so that it sits correctly on a person \
         seen through a webcam. You receive the person's body landmarks from \
         MediaPipe Pose, the model's current transform and optional feedback \
         from the wearer.\n\n",
    );
    let _ = writeln!(
        prompt,
        "The video frame is {} pixels wide and {} pixels high. Landmark x and y are \
         normalized to the frame; z is depth relative to the hips (smaller is closer).\n",
        request.frame_width, request.frame_height
    );

    prompt.push_str("Pose landmarks:\n");
    for (i, kp) in request.keypoints.iter().enumerate() {
        let _ = writeln!(
            prompt,
            "  {}: x={:.4}, y={:.4}, z={:.4}, visibility={:.2}",
            i, kp.x, kp.y, kp.z, kp.visibility
        );
    }

    let _ = writeln!(
        prompt,
        "\nCurrent model parameters:\nscale={}, rotationY={}, positionX={}, positionY={}, positionZ={}\n",
        p.scale, p.rotation_y, p.position_x, p.position_y, p.position_z
    );

    if let Some(summary) = request.landmarks().as_ref().map(PoseSummary::from_landmarks) {
        let _ = writeln!(
            prompt,
            "Derived measurements:\n  shoulder width={:.4}, hip width={:.4}, torso length={:.4}\n  \
             shoulder center=({:.4}, {:.4}), hip center=({:.4}, {:.4}), estimated body yaw={:.3} rad\n",
            summary.shoulder_width,
            summary.hip_width,
            summary.torso_length,
            summary.shoulder_center.x,
            summary.shoulder_center.y,
            summary.hip_center.x,
            summary.hip_center.y,
            summary.body_yaw,
        );
    }

    prompt.push_str("Wearer feedback:\n");
    match request.feedback.as_deref().filter(|f| !f.trim().is_empty()) {
        Some(feedback) => {
            let _ = writeln!(prompt, "  {}\n", feedback.trim());
        }
        None => prompt.push_str("  No feedback provided.\n\n"),
    }

    prompt.push_str(
        "Guidance:\n\
         * Shoulders (landmarks 11 and 12) set the shoulder width of tops.\n\
         * Hips (landmarks 23 and 24) set the waist position of trousers.\n\
         * The overall size of the pose sets the overall scale.\n\
         * rotationY is in radians about the vertical axis.\n\n\
         Return ONLY a JSON object of the form\n\
         {\"updatedModelParameters\": {\"scale\": number, \"rotationY\": number, \
         \"positionX\": number, \"positionY\": number, \"positionZ\": number}, \
         \"reasoning\": string}\n",
    );

    prompt
}

fn response_schema() -> serde_json::Value {
    let number = json!({ "type": "NUMBER" });
    json!({
        "type": "OBJECT",
        "properties": {
            "updatedModelParameters": {
                "type": "OBJECT",
                "properties": {
                    "scale": number,
                    "rotationY": number,
                    "positionX": number,
                    "positionY": number,
                    "positionZ": number,
                },
                "required": ["scale", "rotationY", "positionX", "positionY", "positionZ"],
            },
            "reasoning": { "type": "STRING" },
        },
        "required": ["updatedModelParameters", "reasoning"],
    })
}

/// Extract the advice from the model's text, tolerating a markdown code fence.
pub fn parse_advice(text: &str) -> Result<AdjustmentResponse, AdvisorError> {
    let text = text.trim();
    let text = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .unwrap_or(text);
    let text = text.strip_suffix("```").unwrap_or(text);

    let advice: AdjustmentResponse = serde_json::from_str(text.trim())
        .map_err(|e| AdvisorError::validation(format!("failed to parse advice JSON: {}", e)))?;
    advice.validated()
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    /// Tried in order until one answers with valid advice.
    pub models: Vec<String>,
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            models: vec!["gemini-2.0-flash".to_string(), "gemini-1.5-flash".to_string()],
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(rename = "responseMimeType")]
    response_mime_type: String,
    #[serde(rename = "responseSchema")]
    response_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: ResponseContent,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

/// Fit advisor backed by the Gemini `generateContent` REST endpoint.
pub struct GeminiFitAdvisor {
    config: GeminiConfig,
    client: Client,
}

impl GeminiFitAdvisor {
    pub fn new(config: GeminiConfig) -> Result<Self, AdvisorError> {
        if config.api_key.trim().is_empty() {
            return Err(AdvisorError::NotConfigured("GEMINI_API_KEY not set".to_string()));
        }
        if config.models.is_empty() {
            return Err(AdvisorError::NotConfigured("no Gemini models configured".to_string()));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AdvisorError::NotConfigured(format!("HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    async fn call_model(&self, model: &str, prompt: &str) -> Result<AdjustmentResponse, AdvisorError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            model
        );

        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json".to_string(),
                response_schema: response_schema(),
            },
        };

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AdvisorError::transport(format!("Gemini request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AdvisorError::transport(format!(
                "Gemini returned {}: {}",
                status, error_text
            )));
        }

        let body: GeminiResponse = response
            .json()
            .await
            .map_err(|e| AdvisorError::validation(format!("failed to parse Gemini response: {}", e)))?;

        let text = body
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.as_str())
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| AdvisorError::validation("no content in Gemini response"))?;

        parse_advice(text)
    }
}

#[async_trait]
impl FitAdvisor for GeminiFitAdvisor {
    async fn improve_fit(
        &self,
        request: &AdjustmentRequest,
    ) -> Result<AdjustmentResponse, AdvisorError> {
        let prompt = build_prompt(request);
        debug!(chars = prompt.len(), "Built fit prompt");

        let mut last_error = None;
        for model in &self.config.models {
            match self.call_model(model, &prompt).await {
                Ok(advice) => {
                    info!(model = %model, "Fit advice received");
                    return Ok(advice);
                }
                Err(e) => {
                    warn!(model = %model, "Fit advice failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AdvisorError::transport("no Gemini model answered")))
    }
}
