//! Productivity classification of domains.
//!
//! A domain is run through an ordered list of rules and the first verdict wins:
//! user overrides, curated lists, TLD hints, keyword scoring, then `Neutral`.

use std::{collections::BTreeSet, fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    error::{CategoryError, StoreError},
    store::{KvStore, BUCKET_CATEGORY_OVERRIDES},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Productive,
    Unproductive,
    Neutral,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Productive => "productive",
            Category::Unproductive => "unproductive",
            Category::Neutral => "neutral",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = CategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "productive" => Ok(Category::Productive),
            "unproductive" => Ok(Category::Unproductive),
            "neutral" => Ok(Category::Neutral),
            other => Err(CategoryError::UnknownCategory(other.to_string())),
        }
    }
}

/// One tier of the classification pipeline. `None` means "no opinion, ask the next rule".
pub trait ClassifyRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn classify(&self, domain: &str) -> Option<Category>;
}

pub const CURATED_PRODUCTIVE: &[&str] = &[
    "github.com",
    "gitlab.com",
    "bitbucket.org",
    "stackoverflow.com",
    "stackexchange.com",
    "docs.google.com",
    "drive.google.com",
    "calendar.google.com",
    "linkedin.com",
    "medium.com",
    "notion.so",
    "atlassian.net",
    "developer.mozilla.org",
    "docs.rs",
    "crates.io",
    "rust-lang.org",
    "python.org",
    "wikipedia.org",
    "coursera.org",
    "udemy.com",
    "khanacademy.org",
    "figma.com",
    "trello.com",
    "slack.com",
];

pub const CURATED_UNPRODUCTIVE: &[&str] = &[
    "youtube.com",
    "facebook.com",
    "twitter.com",
    "instagram.com",
    "reddit.com",
    "netflix.com",
    "tiktok.com",
    "twitch.tv",
    "pinterest.com",
    "9gag.com",
    "hulu.com",
    "disneyplus.com",
    "primevideo.com",
    "snapchat.com",
    "tumblr.com",
];

const PRODUCTIVE_TLDS: &[&str] = &[".edu", ".gov", ".mil", ".ac.uk", ".edu.au"];
const UNPRODUCTIVE_TLDS: &[&str] = &[
    ".xxx", ".porn", ".adult", ".sex", ".casino", ".bet", ".poker",
];

const PRODUCTIVE_KEYWORDS: &[&str] = &[
    "docs", "doc", "dev", "developer", "developers", "api", "code", "learn", "learning",
    "wiki", "research", "course", "courses", "academy", "university", "school", "scholar",
    "jobs", "careers", "mail", "calendar", "office", "work", "jira", "confluence", "git",
];

const UNPRODUCTIVE_KEYWORDS: &[&str] = &[
    "game", "games", "gaming", "play", "video", "videos", "movie", "movies", "tv", "stream",
    "streaming", "fun", "meme", "memes", "social", "bet", "casino", "celebrity", "gossip",
    "anime", "porn",
];

/// Substring-containment lookup against fixed domain lists.
pub struct ListRule {
    productive: &'static [&'static str],
    unproductive: &'static [&'static str],
}

impl ListRule {
    pub fn curated() -> Self {
        Self {
            productive: CURATED_PRODUCTIVE,
            unproductive: CURATED_UNPRODUCTIVE,
        }
    }
}

impl ClassifyRule for ListRule {
    fn name(&self) -> &'static str {
        "curated_list"
    }

    fn classify(&self, domain: &str) -> Option<Category> {
        if self.productive.iter().any(|d| domain.contains(d)) {
            return Some(Category::Productive);
        }
        if self.unproductive.iter().any(|d| domain.contains(d)) {
            return Some(Category::Unproductive);
        }
        None
    }
}

pub struct TldRule;

impl ClassifyRule for TldRule {
    fn name(&self) -> &'static str {
        "tld_hint"
    }

    fn classify(&self, domain: &str) -> Option<Category> {
        if PRODUCTIVE_TLDS.iter().any(|t| domain.ends_with(t)) {
            return Some(Category::Productive);
        }
        if UNPRODUCTIVE_TLDS.iter().any(|t| domain.ends_with(t)) {
            return Some(Category::Unproductive);
        }
        None
    }
}

pub struct KeywordRule;

impl ClassifyRule for KeywordRule {
    fn name(&self) -> &'static str {
        "keyword_score"
    }

    fn classify(&self, domain: &str) -> Option<Category> {
        let mut productive = 0usize;
        let mut unproductive = 0usize;
        for token in domain.split(['.', '-']).filter(|t| !t.is_empty()) {
            if PRODUCTIVE_KEYWORDS.contains(&token) {
                productive += 1;
            }
            if UNPRODUCTIVE_KEYWORDS.contains(&token) {
                unproductive += 1;
            }
        }
        match productive.cmp(&unproductive) {
            std::cmp::Ordering::Greater => Some(Category::Productive),
            std::cmp::Ordering::Less => Some(Category::Unproductive),
            std::cmp::Ordering::Equal => None,
        }
    }
}

/// User-chosen categories. The two sets never share an entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideSet {
    #[serde(default)]
    pub productive: BTreeSet<String>,
    #[serde(default)]
    pub unproductive: BTreeSet<String>,
}

impl OverrideSet {
    /// Applies one override. `Neutral` clears the domain from both sets.
    pub fn apply(&mut self, domain: &str, category: Category) {
        self.productive.remove(domain);
        self.unproductive.remove(domain);
        match category {
            Category::Productive => {
                self.productive.insert(domain.to_string());
            }
            Category::Unproductive => {
                self.unproductive.insert(domain.to_string());
            }
            Category::Neutral => {}
        }
    }
}

impl ClassifyRule for OverrideSet {
    fn name(&self) -> &'static str {
        "user_override"
    }

    fn classify(&self, domain: &str) -> Option<Category> {
        if self.productive.iter().any(|d| domain.contains(d.as_str())) {
            return Some(Category::Productive);
        }
        if self.unproductive.iter().any(|d| domain.contains(d.as_str())) {
            return Some(Category::Unproductive);
        }
        None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideStats {
    pub user_productive_count: usize,
    pub user_unproductive_count: usize,
    pub total_productive_known: usize,
    pub total_unproductive_known: usize,
}

pub struct Categorizer {
    store: Arc<dyn KvStore>,
    overrides: OverrideSet,
    rules: Vec<Box<dyn ClassifyRule>>,
}

impl Categorizer {
    /// Default rule chain behind the user overrides.
    pub fn default_rules() -> Vec<Box<dyn ClassifyRule>> {
        vec![
            Box::new(ListRule::curated()),
            Box::new(TldRule),
            Box::new(KeywordRule),
        ]
    }

    pub fn new(store: Arc<dyn KvStore>, overrides: OverrideSet) -> Self {
        Self {
            store,
            overrides,
            rules: Self::default_rules(),
        }
    }

    /// Restores persisted overrides. Unreadable state degrades to "no overrides".
    pub async fn load(store: Arc<dyn KvStore>) -> Self {
        let overrides = match store.get(BUCKET_CATEGORY_OVERRIDES).await {
            Ok(Some(v)) => serde_json::from_value::<OverrideSet>(v).unwrap_or_else(|err| {
                warn!("category overrides unreadable, starting empty: {err}");
                OverrideSet::default()
            }),
            Ok(None) => OverrideSet::default(),
            Err(err) => {
                warn!("category overrides load failed, starting empty: {err}");
                OverrideSet::default()
            }
        };
        Self::new(store, overrides)
    }

    fn rule_chain(&self) -> impl Iterator<Item = &dyn ClassifyRule> + '_ {
        let overrides: &dyn ClassifyRule = &self.overrides;
        std::iter::once(overrides).chain(
            self.rules
                .iter()
                .map(|r| r.as_ref() as &dyn ClassifyRule),
        )
    }

    pub fn classify(&self, domain: &str) -> Category {
        let domain = domain.trim().to_lowercase();
        self.rule_chain()
            .find_map(|rule| rule.classify(&domain))
            .unwrap_or(Category::Neutral)
    }

    /// Name of the rule that decides `domain`, for diagnostics.
    pub fn explain(&self, domain: &str) -> &'static str {
        let domain = domain.trim().to_lowercase();
        self.rule_chain()
            .find(|rule| rule.classify(&domain).is_some())
            .map(|rule| rule.name())
            .unwrap_or("default")
    }

    /// Records a user override and persists it before it takes effect.
    pub async fn set_override(
        &mut self,
        domain: &str,
        category: Category,
    ) -> Result<(), CategoryError> {
        let domain = domain.trim().to_lowercase();
        if domain.is_empty() {
            return Err(CategoryError::EmptyDomain);
        }

        let mut next = self.overrides.clone();
        next.apply(&domain, category);
        if next == self.overrides {
            return Ok(());
        }

        let value = serde_json::to_value(&next).map_err(|source| StoreError::Encode {
            bucket: BUCKET_CATEGORY_OVERRIDES.to_string(),
            source,
        })?;
        self.store.set(BUCKET_CATEGORY_OVERRIDES, &value).await?;
        self.overrides = next;
        info!("category override: {domain} -> {category}");
        Ok(())
    }

    pub fn overrides(&self) -> &OverrideSet {
        &self.overrides
    }

    pub fn override_stats(&self) -> OverrideStats {
        OverrideStats {
            user_productive_count: self.overrides.productive.len(),
            user_unproductive_count: self.overrides.unproductive.len(),
            total_productive_known: CURATED_PRODUCTIVE.len() + self.overrides.productive.len(),
            total_unproductive_known: CURATED_UNPRODUCTIVE.len()
                + self.overrides.unproductive.len(),
        }
    }
}
