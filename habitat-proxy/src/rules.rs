//! Ordered routing rules.
//!
//! Rules are matched by URL-path prefix in insertion order; the first rule
//! whose matcher prefixes the request path handles it.

use crate::embedded::EmbeddedFs;
use habitat_core::{HabitatError, Result, ReverseProxyRule, ReverseProxyRuleType};
use reqwest::Url;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub enum Rule {
    Redirect {
        matcher: String,
        target: Url,
    },
    FileServer {
        matcher: String,
        path: PathBuf,
    },
    Embedded {
        matcher: String,
        fs: Arc<EmbeddedFs>,
    },
}

impl Rule {
    pub fn matcher(&self) -> &str {
        match self {
            Rule::Redirect { matcher, .. } => matcher,
            Rule::FileServer { matcher, .. } => matcher,
            Rule::Embedded { matcher, .. } => matcher,
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(self.matcher())
    }
}

/// Strips `matcher` from `path`, always returning an absolute path.
pub fn strip_matcher(path: &str, matcher: &str) -> String {
    let rest = path.strip_prefix(matcher).unwrap_or(path);
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    }
}

#[derive(Debug, Clone)]
pub struct RuleEntry {
    pub id: String,
    pub app_id: Option<String>,
    pub rule: Arc<Rule>,
}

/// Builds runnable rules from the declared ones in node state.
#[derive(Debug, Clone, Default)]
pub struct RuleFactory {
    web_bundle_path: Option<PathBuf>,
    embedded: HashMap<String, Arc<EmbeddedFs>>,
}

impl RuleFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relative file-server targets resolve under `path`.
    pub fn with_web_bundle_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.web_bundle_path = Some(path.into());
        self
    }

    pub fn with_embedded(mut self, name: impl Into<String>, fs: EmbeddedFs) -> Self {
        self.embedded.insert(name.into(), Arc::new(fs));
        self
    }

    pub fn build(&self, declared: &ReverseProxyRule) -> Result<Rule> {
        let matcher = declared.matcher.clone();
        match declared.rule_type {
            ReverseProxyRuleType::Redirect => {
                let target = Url::parse(&declared.target).map_err(|e| {
                    HabitatError::InvalidInput(format!(
                        "rule {} has an invalid redirect target {}: {}",
                        declared.id, declared.target, e
                    ))
                })?;
                Ok(Rule::Redirect { matcher, target })
            }
            ReverseProxyRuleType::File => Ok(Rule::FileServer {
                matcher,
                path: self.resolve(Path::new(&declared.target)),
            }),
            ReverseProxyRuleType::Embedded => {
                let fs = self.embedded.get(&declared.target).cloned().ok_or_else(|| {
                    HabitatError::NotFound(format!("embedded filesystem {}", declared.target))
                })?;
                Ok(Rule::Embedded { matcher, fs })
            }
        }
    }

    fn resolve(&self, target: &Path) -> PathBuf {
        match &self.web_bundle_path {
            Some(base) if target.is_relative() => base.join(target),
            _ => target.to_path_buf(),
        }
    }
}

/// Rules in insertion order, guarded by a reader/writer lock. The optional
/// fallback rule is consulted only when no ordered rule matches.
#[derive(Debug, Default)]
pub struct RuleSet {
    entries: RwLock<Vec<RuleEntry>>,
    fallback: RwLock<Option<RuleEntry>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule at the end, or replaces an existing rule with the same id
    /// in place so its position is kept.
    pub async fn insert(&self, id: impl Into<String>, app_id: Option<String>, rule: Rule) {
        let id = id.into();
        let entry = RuleEntry {
            id: id.clone(),
            app_id,
            rule: Arc::new(rule),
        };
        let mut entries = self.entries.write().await;
        match entries.iter_mut().find(|existing| existing.id == id) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }

    /// Replaces every ordered rule at once, keeping the order of `entries`.
    pub async fn replace_all(&self, entries: Vec<RuleEntry>) {
        *self.entries.write().await = entries;
    }

    pub async fn set_fallback(&self, id: impl Into<String>, rule: Rule) {
        *self.fallback.write().await = Some(RuleEntry {
            id: id.into(),
            app_id: None,
            rule: Arc::new(rule),
        });
    }

    pub async fn remove(&self, id: &str) -> bool {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Removes every rule owned by `app_id`, returning their ids.
    pub async fn remove_app(&self, app_id: &str) -> Vec<String> {
        let mut entries = self.entries.write().await;
        let mut removed = Vec::new();
        entries.retain(|entry| {
            if entry.app_id.as_deref() == Some(app_id) {
                removed.push(entry.id.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.iter().any(|entry| entry.id == id)
    }

    pub async fn ids(&self) -> Vec<String> {
        self.entries.read().await.iter().map(|entry| entry.id.clone()).collect()
    }

    /// Ids of the rules owned by `app_id`, in routing order.
    pub async fn ids_for_app(&self, app_id: &str) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|entry| entry.app_id.as_deref() == Some(app_id))
            .map(|entry| entry.id.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// First rule in insertion order whose matcher prefixes `path`, then
    /// the fallback.
    pub async fn find(&self, path: &str) -> Option<RuleEntry> {
        let found = self
            .entries
            .read()
            .await
            .iter()
            .find(|entry| entry.rule.matches(path))
            .cloned();
        if found.is_some() {
            return found;
        }
        self.fallback
            .read()
            .await
            .as_ref()
            .filter(|entry| entry.rule.matches(path))
            .cloned()
    }
}
