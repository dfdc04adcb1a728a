//! Static request checks: user-agent signatures and honeypot paths.

use crate::config::BotDetectionConfig;

/// Result of inspecting a User-Agent header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserAgentAnalysis {
    pub score: u32,
    /// Automation signatures found in the header
    pub matches: Vec<String>,
    /// Header absent, empty, or implausibly short
    pub missing: bool,
}

/// Score a User-Agent header against the configured signatures.
pub fn analyze_user_agent(user_agent: Option<&str>, config: &BotDetectionConfig) -> UserAgentAnalysis {
    let user_agent = user_agent.map(str::trim).unwrap_or_default();
    let lowered = user_agent.to_lowercase();

    let matches: Vec<String> = config
        .user_agent_signatures
        .iter()
        .filter(|signature| !signature.is_empty() && lowered.contains(&signature.to_lowercase()))
        .cloned()
        .collect();

    let missing = user_agent.chars().count() < config.min_user_agent_length.max(1);

    let mut score = matches.len() as u32 * config.ua_match_weight;
    if missing {
        score += config.missing_user_agent_weight;
    }

    UserAgentAnalysis {
        score,
        matches,
        missing,
    }
}

/// The decoy `path` hits, if any.
///
/// A path matches a decoy when it equals it or lies below it
/// (`/wp-admin/setup.php` matches `/wp-admin`, `/testimonials` does not
/// match `/test`). Comparison ignores case.
pub fn honeypot_match<'a>(path: &str, config: &'a BotDetectionConfig) -> Option<&'a str> {
    if !config.enable_honeypot {
        return None;
    }

    let path = path.to_lowercase();
    config
        .honeypot_paths
        .iter()
        .find(|decoy| {
            let decoy = decoy.trim_end_matches('/').to_lowercase();
            if decoy.is_empty() {
                return false;
            }
            match path.strip_prefix(decoy.as_str()) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            }
        })
        .map(String::as_str)
}
