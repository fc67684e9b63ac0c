//! Destination image reference parsing
//!
//! Accepted forms are `{registry}/{repository}:{tag}`,
//! `{registry}/{repository}@{digest}` and `{registry}/{repository}` (tag
//! `latest`). The registry may carry an explicit `http://` or `https://`
//! scheme, which then overrides scheme negotiation.

use crate::error::{ImportError, Result};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Tag(String),
    Digest(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub scheme: Option<Scheme>,
    pub registry: String,
    pub repository: String,
    pub reference: Reference,
}

impl ImageReference {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let (scheme, rest) = if let Some(rest) = trimmed.strip_prefix("https://") {
            (Some(Scheme::Https), rest)
        } else if let Some(rest) = trimmed.strip_prefix("http://") {
            (Some(Scheme::Http), rest)
        } else {
            (None, trimmed)
        };

        let (registry, remainder) = rest.split_once('/').ok_or_else(|| {
            ImportError::Configuration(format!(
                "Invalid destination '{}': expected <registry>/<repository>[:tag]",
                input
            ))
        })?;
        if registry.is_empty() {
            return Err(ImportError::Configuration(format!(
                "Invalid destination '{}': registry host is empty",
                input
            )));
        }

        let (repository, reference) = match remainder.split_once('@') {
            Some((repository, digest)) => {
                validate_digest(digest)?;
                (repository, Reference::Digest(digest.to_string()))
            }
            None => match remainder.rsplit_once(':') {
                Some((repository, tag)) if !tag.contains('/') => {
                    validate_tag(tag)?;
                    (repository, Reference::Tag(tag.to_string()))
                }
                _ => (remainder, Reference::Tag(DEFAULT_TAG.to_string())),
            },
        };
        validate_repository(repository)?;

        Ok(Self {
            scheme,
            registry: registry.to_string(),
            repository: repository.to_string(),
            reference,
        })
    }

    /// Tag or digest as used in the manifest URL
    pub fn reference_str(&self) -> &str {
        match &self.reference {
            Reference::Tag(tag) => tag,
            Reference::Digest(digest) => digest,
        }
    }
}

impl FromStr for ImageReference {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            Reference::Tag(tag) => write!(f, "{}/{}:{}", self.registry, self.repository, tag),
            Reference::Digest(digest) => write!(f, "{}/{}@{}", self.registry, self.repository, digest),
        }
    }
}

fn validate_repository(repository: &str) -> Result<()> {
    let valid_chars = repository
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-' | '/'));
    if repository.is_empty()
        || !valid_chars
        || repository.starts_with('/')
        || repository.ends_with('/')
        || repository.contains("//")
    {
        return Err(ImportError::Configuration(format!(
            "Invalid repository name '{}'",
            repository
        )));
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<()> {
    let valid_chars = tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if tag.is_empty() || tag.len() > 128 || !valid_chars || tag.starts_with(['.', '-']) {
        return Err(ImportError::Configuration(format!("Invalid tag '{}'", tag)));
    }
    Ok(())
}

fn validate_digest(digest: &str) -> Result<()> {
    match digest.split_once(':') {
        Some((algorithm, hex)) if !algorithm.is_empty() && !hex.is_empty() => Ok(()),
        _ => Err(ImportError::Configuration(format!("Invalid digest reference '{}'", digest))),
    }
}
