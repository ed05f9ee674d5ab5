//! Fuzzy comparison of application names against cask tokens.
//!
//! Scores are integers in `0..=100`. Two backends implement [`Scorer`]:
//! [`StrsimScorer`] (edit-distance based, via `strsim`) and [`BasicScorer`],
//! a coarse exact/substring scorer used when the richer backend is disabled.
//! Both are pure and can be shared freely across threads.

/// Scoring backend contract.
pub trait Scorer: Send + Sync {
    /// Whole-string similarity.
    fn ratio(&self, a: &str, b: &str) -> u8;

    /// Best similarity of the shorter string against any window of the longer one.
    fn partial_ratio(&self, a: &str, b: &str) -> u8;
}

/// Edit-distance scorer backed by `strsim`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrsimScorer;

impl Scorer for StrsimScorer {
    fn ratio(&self, a: &str, b: &str) -> u8 {
        let a = a.to_lowercase();
        let b = b.to_lowercase();
        if a == b {
            return 100;
        }
        to_score(strsim::normalized_levenshtein(&a, &b))
    }

    fn partial_ratio(&self, a: &str, b: &str) -> u8 {
        let a = a.to_lowercase();
        let b = b.to_lowercase();
        let (short, long) = if a.chars().count() <= b.chars().count() {
            (a, b)
        } else {
            (b, a)
        };
        if short.is_empty() {
            return if long.is_empty() { 100 } else { 0 };
        }
        if long.contains(short.as_str()) {
            return 100;
        }

        let long_chars: Vec<char> = long.chars().collect();
        let width = short.chars().count();
        let mut best = 0.0f64;
        for start in 0..=(long_chars.len() - width) {
            let window: String = long_chars[start..start + width].iter().collect();
            let score = strsim::normalized_levenshtein(&short, &window);
            if score > best {
                best = score;
            }
        }
        to_score(best)
    }
}

/// Minimal fallback: exact and substring matches only.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicScorer;

impl Scorer for BasicScorer {
    fn ratio(&self, a: &str, b: &str) -> u8 {
        let a = a.to_lowercase();
        let b = b.to_lowercase();
        if a == b {
            return 100;
        }
        let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
        if !short.is_empty() && long.contains(short.as_str()) {
            let total = (short.chars().count() + long.chars().count()) as f64;
            return to_score(2.0 * short.chars().count() as f64 / total);
        }
        0
    }

    fn partial_ratio(&self, a: &str, b: &str) -> u8 {
        let a = a.to_lowercase();
        let b = b.to_lowercase();
        if a == b
            || (!a.is_empty() && b.contains(a.as_str()))
            || (!b.is_empty() && a.contains(b.as_str()))
        {
            100
        } else {
            0
        }
    }
}

fn to_score(similarity: f64) -> u8 {
    (similarity.clamp(0.0, 1.0) * 100.0).round() as u8
}

/// Which scoring backend a [`NameMatcher`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Strsim,
    Basic,
}

/// Name matcher used by the scheduler and orchestrator.
pub struct NameMatcher {
    scorer: Box<dyn Scorer>,
    backend: Backend,
}

impl std::fmt::Debug for NameMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameMatcher")
            .field("backend", &self.backend)
            .finish()
    }
}

impl Default for NameMatcher {
    fn default() -> Self {
        Self::new(Backend::default())
    }
}

impl NameMatcher {
    pub fn new(backend: Backend) -> Self {
        let scorer: Box<dyn Scorer> = match backend {
            Backend::Strsim => Box::new(StrsimScorer),
            Backend::Basic => Box::new(BasicScorer),
        };
        Self { scorer, backend }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn ratio(&self, a: &str, b: &str) -> u8 {
        self.scorer.ratio(a, b)
    }

    pub fn partial_ratio(&self, a: &str, b: &str) -> u8 {
        self.scorer.partial_ratio(a, b)
    }

    /// Similarity between an application name and a cask token, after
    /// normalizing both. Substring matches only count for names of at
    /// least three characters so that "a" does not match everything.
    pub fn similarity(&self, app_name: &str, token: &str) -> u8 {
        let a = normalize_app_name(app_name);
        let b = normalize_app_name(token);
        let ratio = self.ratio(&a, &b);
        if a.chars().count().min(b.chars().count()) < 3 {
            return ratio;
        }
        ratio.max(self.partial_ratio(&a, &b))
    }

    /// Best candidate scoring at least `cutoff`. Ties keep the earliest candidate.
    pub fn best_match<'a, S: AsRef<str>>(
        &self,
        query: &str,
        candidates: &'a [S],
        cutoff: u8,
    ) -> Option<(&'a str, u8)> {
        let mut best: Option<(&'a str, u8)> = None;
        for candidate in candidates {
            let candidate = candidate.as_ref();
            let score = self.similarity(query, candidate);
            if score < cutoff {
                continue;
            }
            match best {
                Some((_, top)) if score <= top => {}
                _ => best = Some((candidate, score)),
            }
        }
        best
    }
}

/// Normalize an application name toward cask token form:
/// lowercase, `.app` stripped, whitespace and underscores turned into dashes.
pub fn normalize_app_name(name: &str) -> String {
    let trimmed = name.trim();
    let trimmed = trimmed
        .strip_suffix(".app")
        .or_else(|| trimmed.strip_suffix(".APP"))
        .unwrap_or(trimmed);

    let mut out = String::with_capacity(trimmed.len());
    let mut last_dash = false;
    for c in trimmed.chars() {
        if c.is_whitespace() || c == '_' || c == '-' {
            if !last_dash && !out.is_empty() {
                out.push('-');
                last_dash = true;
            }
        } else {
            out.extend(c.to_lowercase());
            last_dash = false;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio_case_insensitive_exact() {
        let m = NameMatcher::default();
        assert_eq!(m.ratio("Firefox", "firefox"), 100);
        assert!(m.ratio("firefox", "firefax") < 100);
        assert!(m.ratio("firefox", "firefax") > 70);
        assert_eq!(m.ratio("abc", "xyz"), 0);
    }

    #[test]
    fn test_partial_ratio_substring() {
        let m = NameMatcher::default();
        assert!(m.partial_ratio("chrome", "google-chrome") >= 75);
        assert_eq!(m.partial_ratio("google-chrome", "chrome"), 100);
        assert!(m.partial_ratio("chrone", "google-chrome") >= 80);
    }

    #[test]
    fn test_similarity_normalizes_names() {
        let m = NameMatcher::default();
        assert_eq!(m.similarity("Google Chrome", "google-chrome"), 100);
        assert_eq!(m.similarity("Visual Studio Code.app", "visual-studio-code"), 100);
    }

    #[test]
    fn test_short_names_do_not_substring_match() {
        let m = NameMatcher::default();
        assert!(m.similarity("a", "alacritty") < 75);
    }

    #[test]
    fn test_best_match_ties_keep_first() {
        let m = NameMatcher::default();
        let candidates = ["slack", "slack", "slacker"];
        let (name, score) = m.best_match("Slack", &candidates, 75).unwrap();
        assert_eq!(name, "slack");
        assert_eq!(score, 100);

        let tied = ["firefox-nightly", "firefox-developer-edition"];
        let (name, _) = m.best_match("firefox", &tied, 75).unwrap();
        assert_eq!(name, "firefox-nightly");
    }

    #[test]
    fn test_best_match_respects_cutoff() {
        let m = NameMatcher::default();
        let candidates = ["zoom", "notion"];
        assert!(m.best_match("Photoshop", &candidates, 75).is_none());
    }

    #[test]
    fn test_basic_backend_contract() {
        let m = NameMatcher::new(Backend::Basic);
        assert_eq!(m.backend(), Backend::Basic);
        assert_eq!(m.ratio("Slack", "slack"), 100);
        assert_eq!(m.ratio("firefox", "firefax"), 0);
        assert_eq!(m.partial_ratio("chrome", "google-chrome"), 100);
        assert_eq!(m.partial_ratio("chrome", "safari"), 0);
        let r = m.ratio("chrome", "google-chrome");
        assert!(r > 0 && r < 100);
    }

    #[test]
    fn test_normalize_app_name() {
        assert_eq!(normalize_app_name("Google Chrome.app"), "google-chrome");
        assert_eq!(normalize_app_name("  Visual  Studio_Code "), "visual-studio-code");
        assert_eq!(normalize_app_name("1Password 7"), "1password-7");
        assert_eq!(normalize_app_name(""), "");
    }
}
