//! Playback decision engine
//!
//! A pure function from `(source truth, client capabilities, policy)` to a
//! playback decision. The engine is deterministic: equal normalized inputs
//! produce equal outputs and an equal `input_hash`, across runs and across
//! processes. Unknown or ambiguous inputs fail closed.
//!
//! Inputs arrive as a JSON document with a closed-world root schema. Both
//! the compact (`source`, `caps`, `policy`) and the legacy capitalized
//! (`Source`, `Caps`, `Policy`) spellings are recognized; when both are
//! present their normalized values must agree (overlap equivalence), and
//! the canonical hash is identical for either spelling.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::web::problem::Problem;

/// Truncated width of the hex-encoded decision input hash
const INPUT_HASH_WIDTH: usize = 16;

#[derive(Debug, Error)]
pub enum DecisionError {
    /// Unknown root key, non-object root value, or malformed field
    #[error("invalid decision input: {0}")]
    Invalid(String),

    /// No capabilities present in the request
    #[error("client capabilities missing")]
    CapabilitiesMissing,

    /// Legacy and compact roots disagree on a shared key
    #[error("legacy and compact inputs disagree")]
    Ambiguous { input_hash: String },

    /// Internal contradiction; stop the line
    #[error("decision invariant violated: {0}")]
    Invariant(String),
}

impl DecisionError {
    pub fn to_problem(&self) -> Problem {
        match self {
            Self::Invalid(detail) => Problem::new(
                "decision/schema-invalid",
                "Invalid Decision Input",
                400,
                "capabilities_invalid",
            )
            .detail(detail.as_str()),
            Self::CapabilitiesMissing => Problem::new(
                "decision/schema-less",
                "Capabilities Missing",
                412,
                "capabilities_missing",
            ),
            Self::Ambiguous { input_hash } => Problem::new(
                "decision/ambiguous",
                "Ambiguous Decision Input",
                422,
                "decision_ambiguous",
            )
            .extra("inputHash", input_hash.clone()),
            Self::Invariant(detail) => Problem::new(
                "system/internal",
                "Invariant Violation",
                500,
                "R_INVARIANT_VIOLATION",
            )
            .detail(detail.as_str()),
        }
    }
}

/// What the media actually is
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SourceTruth {
    pub container: String,
    pub video_codec: String,
    pub audio_codec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// What the client can play
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientCaps {
    pub containers: Vec<String>,
    pub video_codecs: Vec<String>,
    pub audio_codecs: Vec<String>,
    #[serde(default)]
    pub max_w: u32,
    #[serde(default)]
    pub max_h: u32,
    #[serde(rename = "supportsHLS", default)]
    pub supports_hls: bool,
}

/// One direct-play rule; the source must be a member of every set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DirectPlayRule {
    pub containers: Vec<String>,
    pub video_codecs: Vec<String>,
    pub audio_codecs: Vec<String>,
}

/// Decision policy. Direct play happens only through an explicit rule;
/// without rules every admissible request transcodes (or is denied when
/// transcoding is off).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DecisionPolicy {
    #[serde(default)]
    pub direct_play: Vec<DirectPlayRule>,
    #[serde(default = "default_true")]
    pub allow_transcode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            direct_play: Vec::new(),
            allow_transcode: true,
        }
    }
}

/// Fully parsed and normalized decision inputs
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionInputs {
    pub source: SourceTruth,
    pub caps: ClientCaps,
    pub policy: DecisionPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMode {
    DirectPlay,
    Transcode,
    Deny,
}

impl DecisionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectPlay => "direct_play",
            Self::Transcode => "transcode",
            Self::Deny => "deny",
        }
    }
}

/// The decision, replay-safe for identical canonical inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionOutput {
    pub mode: DecisionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_output_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_output_kind: Option<String>,
    pub is_seekable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub input_hash: String,
}

/// Root keys the closed-world schema recognizes, compact and legacy
const RECOGNIZED_ROOTS: &[(&str, &str)] =
    &[("source", "Source"), ("caps", "Caps"), ("policy", "Policy")];

/// Normalize a token: trim, fold Unicode whitespace runs to one space,
/// lowercase
pub fn normalize_token(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn normalize_list(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = raw.iter().map(|s| normalize_token(s)).collect();
    out.sort();
    out.dedup();
    out
}

impl SourceTruth {
    fn normalized(&self) -> Self {
        Self {
            container: normalize_token(&self.container),
            video_codec: normalize_token(&self.video_codec),
            audio_codec: normalize_token(&self.audio_codec),
            fps: self.fps,
            width: self.width,
            height: self.height,
        }
    }
}

impl ClientCaps {
    fn normalized(&self) -> Self {
        Self {
            containers: normalize_list(&self.containers),
            video_codecs: normalize_list(&self.video_codecs),
            audio_codecs: normalize_list(&self.audio_codecs),
            max_w: self.max_w,
            max_h: self.max_h,
            supports_hls: self.supports_hls,
        }
    }
}

impl DecisionPolicy {
    fn normalized(&self) -> Self {
        Self {
            direct_play: self
                .direct_play
                .iter()
                .map(|r| DirectPlayRule {
                    containers: normalize_list(&r.containers),
                    video_codecs: normalize_list(&r.video_codecs),
                    audio_codecs: normalize_list(&r.audio_codecs),
                })
                .collect(),
            allow_transcode: self.allow_transcode,
        }
    }
}

/// Parse a JSON document under the closed-world root schema.
///
/// Returns `Ok(None)` when the document carries no decision roots at all
/// (the caller then skips the engine entirely).
pub fn parse_inputs(root: &serde_json::Value) -> Result<Option<DecisionInputs>, DecisionError> {
    let obj = match root {
        serde_json::Value::Object(map) => map,
        _ => return Err(DecisionError::Invalid("input is not an object".into())),
    };

    let mut any_root = false;
    for key in obj.keys() {
        if RECOGNIZED_ROOTS
            .iter()
            .any(|(compact, legacy)| key == compact || key == legacy)
        {
            any_root = true;
        } else {
            return Err(DecisionError::Invalid(format!("unknown root key `{key}`")));
        }
    }
    if !any_root {
        return Ok(None);
    }

    let source = merged_root::<SourceTruth>(obj, "source", "Source")?;
    let caps = merged_root::<ClientCaps>(obj, "caps", "Caps")?;
    let policy = merged_root::<DecisionPolicy>(obj, "policy", "Policy")?;

    let Some(source) = source else {
        return Err(DecisionError::Invalid("source truth missing".into()));
    };
    let Some(caps) = caps else {
        return Err(DecisionError::CapabilitiesMissing);
    };

    Ok(Some(DecisionInputs {
        source,
        caps,
        policy: policy.unwrap_or_default(),
    }))
}

/// Parse one root under both spellings and enforce overlap equivalence
fn merged_root<T>(
    obj: &serde_json::Map<String, serde_json::Value>,
    compact: &str,
    legacy: &str,
) -> Result<Option<T>, DecisionError>
where
    T: serde::de::DeserializeOwned + Normalizable + PartialEq + HashLines,
{
    let parse_one = |key: &str| -> Result<Option<T>, DecisionError> {
        match obj.get(key) {
            None => Ok(None),
            Some(value) if value.is_object() => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| DecisionError::Invalid(format!("{key}: {e}"))),
            Some(_) => Err(DecisionError::Invalid(format!(
                "root key `{key}` is not an object"
            ))),
        }
    };

    let compact_value = parse_one(compact)?.map(|v: T| v.normalize());
    let legacy_value = parse_one(legacy)?.map(|v: T| v.normalize());

    match (compact_value, legacy_value) {
        (Some(a), Some(b)) if a != b => Err(DecisionError::Ambiguous {
            input_hash: truncate_hash(&a.hash_lines(compact)),
        }),
        (Some(a), _) => Ok(Some(a)),
        (None, b) => Ok(b),
    }
}

/// Internal helper traits so `merged_root` stays generic over the three roots
pub trait Normalizable {
    fn normalize(self) -> Self;
}
pub trait HashLines {
    /// Canonical `key=value` lines for the input hash, prefixed with the
    /// lowercase root name
    fn hash_lines(&self, root: &str) -> Vec<String>;
}

impl Normalizable for SourceTruth {
    fn normalize(self) -> Self {
        self.normalized()
    }
}
impl Normalizable for ClientCaps {
    fn normalize(self) -> Self {
        self.normalized()
    }
}
impl Normalizable for DecisionPolicy {
    fn normalize(self) -> Self {
        self.normalized()
    }
}

impl HashLines for SourceTruth {
    fn hash_lines(&self, root: &str) -> Vec<String> {
        let mut lines = vec![
            format!("{root}.container={}", self.container),
            format!("{root}.videocodec={}", self.video_codec),
            format!("{root}.audiocodec={}", self.audio_codec),
        ];
        if let Some(fps) = self.fps {
            lines.push(format!("{root}.fps={fps}"));
        }
        if let (Some(w), Some(h)) = (self.width, self.height) {
            lines.push(format!("{root}.dims={w}x{h}"));
        }
        lines
    }
}

impl HashLines for ClientCaps {
    fn hash_lines(&self, root: &str) -> Vec<String> {
        vec![
            format!("{root}.containers={}", self.containers.join(",")),
            format!("{root}.videocodecs={}", self.video_codecs.join(",")),
            format!("{root}.audiocodecs={}", self.audio_codecs.join(",")),
            format!("{root}.maxw={}", self.max_w),
            format!("{root}.maxh={}", self.max_h),
            format!("{root}.hls={}", self.supports_hls),
        ]
    }
}

impl HashLines for DecisionPolicy {
    fn hash_lines(&self, root: &str) -> Vec<String> {
        let mut lines: Vec<String> = self
            .direct_play
            .iter()
            .enumerate()
            .map(|(i, r)| {
                format!(
                    "{root}.rule{i}={};{};{}",
                    r.containers.join(","),
                    r.video_codecs.join(","),
                    r.audio_codecs.join(",")
                )
            })
            .collect();
        lines.push(format!("{root}.transcode={}", self.allow_transcode));
        lines
    }
}

fn truncate_hash(lines: &[String]) -> String {
    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    let hex = format!("{:x}", hasher.finalize());
    hex[..INPUT_HASH_WIDTH].to_string()
}

/// Canonical hash over the full normalized input set.
///
/// Root names are the lowercase spellings regardless of which spelling the
/// request used, so legacy and compact documents with equal shared keys hash
/// identically.
pub fn input_hash(inputs: &DecisionInputs) -> String {
    let mut lines = inputs.source.hash_lines("source");
    lines.extend(inputs.caps.hash_lines("caps"));
    lines.extend(inputs.policy.hash_lines("policy"));
    truncate_hash(&lines)
}

/// Decide playback mode for normalized inputs
pub fn decide(inputs: &DecisionInputs) -> Result<DecisionOutput, DecisionError> {
    let hash = input_hash(inputs);
    let source = &inputs.source;
    let caps = &inputs.caps;

    // Dimensions beyond the client's limits rule out direct play
    let fits = match (source.width, source.height) {
        (Some(w), Some(h)) if caps.max_w > 0 && caps.max_h > 0 => w <= caps.max_w && h <= caps.max_h,
        _ => true,
    };

    // Rule-based: a policy without direct-play rules has nothing to match,
    // so control falls through to the transcode/deny arm
    let direct = fits
        && inputs.policy.direct_play.iter().any(|rule| {
            rule.containers.contains(&source.container)
                && rule.video_codecs.contains(&source.video_codec)
                && rule.audio_codecs.contains(&source.audio_codec)
        });

    let mode = if direct {
        DecisionMode::DirectPlay
    } else if inputs.policy.allow_transcode && caps.supports_hls {
        DecisionMode::Transcode
    } else {
        DecisionMode::Deny
    };

    Ok(DecisionOutput {
        mode,
        selected_output_url: None,
        selected_output_kind: None,
        is_seekable: mode == DecisionMode::DirectPlay,
        duration_seconds: None,
        input_hash: hash,
    })
}
