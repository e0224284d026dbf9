//! Per-request fingerprint headers.
//!
//! Each outbound request draws its user agent and accept headers from fixed
//! pools so traffic to a domain does not present a single static signature.
//! This is fingerprint diversity, not security-critical randomness.

use rand::seq::SliceRandom;

/// Real browser user agents for impersonation.
pub const USER_AGENTS: &[&str] = &[
    // Chrome on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    // Chrome on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    // Firefox on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:132.0) Gecko/20100101 Firefox/132.0",
    // Firefox on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:133.0) Gecko/20100101 Firefox/133.0",
    // Safari on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15",
    // Edge on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
];

pub const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-US,en;q=0.8",
    "en-GB,en-US;q=0.9,en;q=0.8",
    "en-US,en;q=0.9,es;q=0.8",
];

pub const ACCEPT_HEADERS: &[&str] = &[
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
];

/// Header set applied to one request.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub user_agent: &'static str,
    pub accept_language: &'static str,
    pub accept: &'static str,
}

impl Fingerprint {
    /// Draw a random fingerprint from the pools.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            user_agent: USER_AGENTS.choose(&mut rng).copied().expect("non-empty pool"),
            accept_language: ACCEPT_LANGUAGES
                .choose(&mut rng)
                .copied()
                .expect("non-empty pool"),
            accept: ACCEPT_HEADERS.choose(&mut rng).copied().expect("non-empty pool"),
        }
    }

    /// Apply fingerprint headers to a request.
    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("User-Agent", self.user_agent)
            .header("Accept", self.accept)
            .header("Accept-Language", self.accept_language)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pools_contain_browser_agents() {
        for ua in USER_AGENTS {
            assert!(ua.contains("Mozilla"));
        }
    }

    #[test]
    fn test_random_fingerprint_comes_from_pools() {
        let fp = Fingerprint::random();
        assert!(USER_AGENTS.contains(&fp.user_agent));
        assert!(ACCEPT_LANGUAGES.contains(&fp.accept_language));
        assert!(ACCEPT_HEADERS.contains(&fp.accept));
    }
}
