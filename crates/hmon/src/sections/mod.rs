// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Section registry: the producer side of the agent.
//!
//! The transport core only ever asks two things of telemetry producers: which
//! sections exist, and what one of them currently says. Both questions go
//! through [`SectionRegistry`]; the core never hands anything back.
//!
//! Rendered sections carry the classic header line:
//!
//! ```text
//! <<<systemtime>>>
//! 1767225600
//! ```

mod builtin;

pub use builtin::{CheckMkSection, MemSection, SystemTimeSection, UptimeSection};
pub(crate) use builtin::seconds_since_epoch;

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Section lookup and rendering failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SectionError {
    /// No provider registered under this name.
    #[error("section not found: {0}")]
    NotFound(String),

    /// The provider exists but could not produce output.
    #[error("section {name} failed: {reason}")]
    Failed {
        /// Section name
        name: String,
        /// Provider-reported cause
        reason: String,
    },
}

/// Ordered source of named telemetry sections.
pub trait SectionRegistry: Send + Sync {
    /// Names of all known sections, in reply order.
    fn list_sections(&self) -> Vec<String>;

    /// Render one section including its header line.
    fn render(&self, name: &str) -> Result<String, SectionError>;
}

/// One telemetry producer.
pub trait SectionProvider: Send + Sync {
    /// Section name as it appears in the header.
    fn name(&self) -> &str;

    /// Current section body, without header.
    fn body(&self) -> Result<String, SectionError>;
}

/// Ordered set of providers implementing [`SectionRegistry`].
#[derive(Default)]
pub struct SectionSet {
    providers: Vec<Arc<dyn SectionProvider>>,
}

impl SectionSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The sections every agent ships with.
    pub fn builtin() -> Self {
        let mut set = Self::new();
        set.register(Arc::new(CheckMkSection::new()));
        set.register(Arc::new(SystemTimeSection));
        set.register(Arc::new(UptimeSection::new()));
        set.register(Arc::new(MemSection));
        set
    }

    /// Add a provider; a provider with the same name is replaced in place.
    pub fn register(&mut self, provider: Arc<dyn SectionProvider>) {
        match self
            .providers
            .iter_mut()
            .find(|p| p.name() == provider.name())
        {
            Some(slot) => *slot = provider,
            None => self.providers.push(provider),
        }
    }

    /// Add a provider that always renders `body`.
    pub fn with_static(mut self, name: &str, body: &str) -> Self {
        self.register(Arc::new(StaticSection::new(name, body)));
        self
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// True if no providers are registered.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl fmt::Debug for SectionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectionSet")
            .field("sections", &self.list_sections())
            .finish()
    }
}

impl SectionRegistry for SectionSet {
    fn list_sections(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    fn render(&self, name: &str) -> Result<String, SectionError> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| SectionError::NotFound(name.to_string()))?;
        Ok(with_header(name, &provider.body()?))
    }
}

/// Provider returning fixed text.
#[derive(Debug, Clone)]
pub struct StaticSection {
    name: String,
    body: String,
}

impl StaticSection {
    /// Section `name` always rendering `body`.
    pub fn new(name: &str, body: &str) -> Self {
        Self {
            name: name.to_string(),
            body: body.to_string(),
        }
    }
}

impl SectionProvider for StaticSection {
    fn name(&self) -> &str {
        &self.name
    }

    fn body(&self) -> Result<String, SectionError> {
        Ok(self.body.clone())
    }
}

/// Prefix `body` with the `<<<name>>>` header and terminate it with a newline.
pub fn with_header(name: &str, body: &str) -> String {
    let mut out = String::with_capacity(name.len() + body.len() + 8);
    out.push_str("<<<");
    out.push_str(name);
    out.push_str(">>>\n");
    out.push_str(body);
    if !body.is_empty() && !body.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Render `names` in order into one payload.
///
/// Unknown names and failing providers are skipped; one bad section never
/// costs the station the others.
pub fn render_sections<S: AsRef<str>>(registry: &dyn SectionRegistry, names: &[S]) -> String {
    let mut out = String::new();
    for name in names {
        let name = name.as_ref();
        match registry.render(name) {
            Ok(text) => out.push_str(&text),
            Err(SectionError::NotFound(_)) => {
                log::debug!("[SECTIONS] unknown section '{}' skipped", name);
            }
            Err(e) => {
                log::warn!("[SECTIONS] {}", e);
            }
        }
    }
    out
}
