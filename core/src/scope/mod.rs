//! Scope matching
//!
//! Decides whether a URL is interesting. Patterns without glob metacharacters
//! are case-sensitive substring tests; anything containing `*`, `?` or `[` is
//! a glob anchored to the whole URL.
//!
//! The compiled set is swapped wholesale under a lock when the settings
//! change. Readers clone an `Arc` to the current set and match without holding
//! the lock, so many capture threads can evaluate while one writer replaces it.

use glob::Pattern;
use std::sync::{Arc, RwLock};

use crate::models::{ScopeDecision, ScopeSettings};

const GLOB_METACHARACTERS: [char; 3] = ['*', '?', '['];

/// A single compiled include/exclude pattern.
#[derive(Debug, Clone)]
pub enum CompiledPattern {
    Substring(String),
    Glob(Pattern),
}

impl CompiledPattern {
    pub fn compile(raw: &str) -> Self {
        if !raw.contains(&GLOB_METACHARACTERS[..]) {
            return CompiledPattern::Substring(raw.to_string());
        }

        // `**` is two "any run" wildcards, not a recursive path component.
        let glob = collapse_stars(raw);
        match Pattern::new(&glob) {
            Ok(pattern) => CompiledPattern::Glob(pattern),
            Err(err) => {
                // Unbalanced brackets are taken literally, as fnmatch does.
                match Pattern::new(&escape_brackets(&glob)) {
                    Ok(pattern) => {
                        tracing::debug!("Scope pattern {:?} compiled with literal brackets: {}", raw, err);
                        CompiledPattern::Glob(pattern)
                    }
                    Err(_) => CompiledPattern::Substring(raw.to_string()),
                }
            }
        }
    }

    pub fn matches(&self, url: &str) -> bool {
        match self {
            CompiledPattern::Substring(needle) => url.contains(needle.as_str()),
            CompiledPattern::Glob(pattern) => pattern.matches(url),
        }
    }
}

fn collapse_stars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '*' && out.ends_with('*') {
            continue;
        }
        out.push(c);
    }
    out
}

fn escape_brackets(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 8);
    for c in raw.chars() {
        match c {
            '[' => out.push_str("[[]"),
            ']' => out.push_str("[]]"),
            other => out.push(other),
        }
    }
    out
}

/// Ordered, compiled pattern list.
#[derive(Debug, Clone, Default)]
pub struct CompiledSet {
    patterns: Vec<CompiledPattern>,
}

impl CompiledSet {
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// True if any pattern matches.
    pub fn matches_any(&self, url: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(url))
    }
}

/// Compile a pattern list, classifying each entry once.
pub fn compile<S: AsRef<str>>(patterns: &[S]) -> CompiledSet {
    CompiledSet {
        patterns: patterns
            .iter()
            .map(|p| CompiledPattern::compile(p.as_ref()))
            .collect(),
    }
}

pub fn matches(set: &CompiledSet, url: &str) -> bool {
    set.matches_any(url)
}

/// Immutable snapshot of one version of the scope.
#[derive(Debug, Clone)]
pub struct CompiledScope {
    pub version: u64,
    pub settings: ScopeSettings,
    include: CompiledSet,
    exclude: CompiledSet,
}

impl CompiledScope {
    fn new(version: u64, settings: ScopeSettings) -> Self {
        let include = compile(&settings.include);
        let exclude = compile(&settings.exclude);
        Self {
            version,
            settings,
            include,
            exclude,
        }
    }

    /// Matches an include (an empty include set matches everything) and no exclude.
    pub fn is_in_scope(&self, url: &str) -> bool {
        if !self.include.is_empty() && !self.include.matches_any(url) {
            return false;
        }
        !self.exclude.matches_any(url)
    }

    pub fn decide(&self, url: &str) -> ScopeDecision {
        let in_scope = self.is_in_scope(url);
        ScopeDecision {
            in_scope,
            drop: !in_scope && self.settings.drop,
        }
    }
}

/// Lock-guarded holder of the current compiled scope.
pub struct ScopeMatcher {
    current: RwLock<Arc<CompiledScope>>,
}

impl Default for ScopeMatcher {
    fn default() -> Self {
        Self::new(ScopeSettings::default())
    }
}

impl ScopeMatcher {
    pub fn new(settings: ScopeSettings) -> Self {
        Self {
            current: RwLock::new(Arc::new(CompiledScope::new(1, settings.normalized()))),
        }
    }

    /// Current compiled scope. Holds the read lock only for the `Arc` clone.
    pub fn snapshot(&self) -> Arc<CompiledScope> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn settings(&self) -> ScopeSettings {
        self.snapshot().settings.clone()
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    /// Swap in new settings. Recompiles only when the settings differ;
    /// returns the version now in effect.
    pub fn replace(&self, settings: ScopeSettings) -> u64 {
        let settings = settings.normalized();
        let current = self.snapshot();
        if current.settings == settings {
            return current.version;
        }

        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Another writer may have installed the same settings meanwhile.
        if guard.settings == settings {
            return guard.version;
        }
        let next = Arc::new(CompiledScope::new(guard.version + 1, settings));
        let version = next.version;
        *guard = next;
        drop(guard);

        tracing::info!("Scope updated to version {}", version);
        version
    }

    pub fn is_in_scope(&self, url: &str) -> bool {
        self.snapshot().is_in_scope(url)
    }

    pub fn decide(&self, url: &str) -> ScopeDecision {
        self.snapshot().decide(url)
    }
}
