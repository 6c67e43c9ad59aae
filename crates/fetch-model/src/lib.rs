//! Data model shared by the randofetch discovery engine and its cache.
//!
//! Everything here is plain serde data: descriptors as they appear in the
//! YAML configuration, visualization methods, and the concrete [`Fetcher`]
//! values that get probed, cached and executed.

use std::fmt;

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};

/// Marker substituted with an image path inside visualization method args.
pub const IMAGE_PLACEHOLDER: &str = "{}";

/// Argument template of a program: either one preformatted string or a list
/// of tokens that is joined with single spaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgTemplate {
    Line(String),
    Tokens(Vec<String>),
}

impl Default for ArgTemplate {
    fn default() -> Self {
        Self::Line(String::new())
    }
}

impl ArgTemplate {
    /// Flatten the template to a single space-joined string.
    pub fn flatten(&self) -> String {
        match self {
            Self::Line(line) => line.trim().to_string(),
            Self::Tokens(tokens) => tokens
                .iter()
                .map(|token| token.trim())
                .filter(|token| !token.is_empty())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.flatten().is_empty()
    }
}

impl From<&str> for ArgTemplate {
    fn from(value: &str) -> Self {
        Self::Line(value.to_string())
    }
}

/// Accepts `args: ~` as an empty template.
pub fn nullable_args<'de, D>(deserializer: D) -> Result<ArgTemplate, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<ArgTemplate>::deserialize(deserializer)?.unwrap_or_default())
}

/// Secondary condition a program needs before it is considered usable.
///
/// Serialized externally tagged (`{binary: kitty}`, `{env: ITERM}`). The
/// deserializer also takes a bare string: `iterm` selects the iTerm
/// environment check, anything else names a binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RequirementRepr")]
pub enum ExtraRequirement {
    /// A binary that must resolve on `PATH`.
    #[serde(rename = "binary")]
    Binary(String),
    /// An environment variable whose name contains this indicator must be set.
    #[serde(rename = "env")]
    EnvCapability(String),
}

impl ExtraRequirement {
    pub const ITERM_INDICATOR: &'static str = "ITERM";

    pub fn name(&self) -> &str {
        match self {
            Self::Binary(name) | Self::EnvCapability(name) => name,
        }
    }
}

impl fmt::Display for ExtraRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary(name) => write!(f, "binary `{name}`"),
            Self::EnvCapability(name) => write!(f, "environment capability `{name}`"),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RequirementRepr {
    Legacy(String),
    Tagged(TaggedRequirement),
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
enum TaggedRequirement {
    Binary(String),
    Env(String),
}

impl From<RequirementRepr> for ExtraRequirement {
    fn from(value: RequirementRepr) -> Self {
        match value {
            RequirementRepr::Legacy(name) if name.trim().eq_ignore_ascii_case("iterm") => {
                Self::EnvCapability(Self::ITERM_INDICATOR.to_string())
            }
            RequirementRepr::Legacy(name) => Self::Binary(name.trim().to_string()),
            RequirementRepr::Tagged(TaggedRequirement::Binary(name)) => Self::Binary(name),
            RequirementRepr::Tagged(TaggedRequirement::Env(name)) => Self::EnvCapability(name),
        }
    }
}

/// A candidate display program as written in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramDescriptor {
    pub name: String,
    pub path: String,
    #[serde(default, deserialize_with = "nullable_args")]
    pub args: ArgTemplate,
    #[serde(default, alias = "extra_reqs", skip_serializing_if = "Option::is_none")]
    pub extra_requirement: Option<ExtraRequirement>,
    #[serde(default)]
    pub needs_image: bool,
}

/// Extra arguments that let the descriptor named `caller` show an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualizationMethod {
    pub name: String,
    pub caller: String,
    #[serde(default, deserialize_with = "nullable_args")]
    pub args: ArgTemplate,
}

impl VisualizationMethod {
    pub fn applies_to(&self, descriptor: &ProgramDescriptor) -> bool {
        self.caller == descriptor.name
    }
}

/// A concrete program invocation, possibly bound to one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fetcher {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub args: ArgTemplate,
    #[serde(default)]
    pub extra_requirement: Option<ExtraRequirement>,
    #[serde(default)]
    pub needs_image: bool,
    /// Resolved, shell-escaped image arguments. Empty when no image is bound.
    #[serde(default)]
    pub image_args: String,
}

impl Fetcher {
    pub fn from_descriptor(descriptor: &ProgramDescriptor) -> Self {
        Self::bound(descriptor, String::new())
    }

    pub fn bound(descriptor: &ProgramDescriptor, image_args: String) -> Self {
        Self {
            name: descriptor.name.clone(),
            path: descriptor.path.clone(),
            args: descriptor.args.clone(),
            extra_requirement: descriptor.extra_requirement.clone(),
            needs_image: descriptor.needs_image,
            image_args,
        }
    }

    pub fn main_args(&self) -> String {
        self.args.flatten()
    }

    pub fn is_image_bound(&self) -> bool {
        !self.image_args.trim().is_empty()
    }

    /// Human readable identity used in logs and timing reports.
    pub fn label(&self) -> String {
        if self.is_image_bound() {
            format!("{} [{}]", self.name, self.image_args.trim())
        } else {
            self.name.clone()
        }
    }
}
