use crate::config::ScopeConfig;
use wildmatch::WildMatch;

/// Decides which request URLs the adaptation service wants to see
#[derive(Debug, Clone, Default)]
pub struct ScopeMatcher {
    allow_list: Vec<WildMatch>,
    block_list: Vec<WildMatch>,
}

impl ScopeMatcher {
    pub fn new(scope: &ScopeConfig) -> Self {
        Self {
            allow_list: scope.allow.iter().map(|p| WildMatch::new(p)).collect(),
            block_list: scope.block.iter().map(|p| WildMatch::new(p)).collect(),
        }
    }

    /// Check whether a request URL is in scope.
    ///
    /// Block patterns win over allow patterns; an empty allow list admits
    /// every host. URLs without a parseable host are only admitted when no
    /// allow list is configured.
    pub fn wants_url(&self, url: &str) -> bool {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_string));

        let Some(host) = host else {
            return self.allow_list.is_empty();
        };

        if self.block_list.iter().any(|pattern| pattern.matches(&host)) {
            return false;
        }

        self.allow_list.is_empty() || self.allow_list.iter().any(|pattern| pattern.matches(&host))
    }
}
