//! Per-dispatch browser fingerprints. Generation is stateless with respect to
//! identity health: every call draws a fresh user agent, viewport, locale and
//! header ordering from a pre-built pool.

use super::pool::EgressIdentity;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Served in rotation whenever the randomized pool has nothing to offer.
pub const FALLBACK_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
];

const OS_TOKENS: &[&str] = &[
    "Windows NT 10.0; Win64; x64",
    "Windows NT 6.1; Win64; x64",
    "Macintosh; Intel Mac OS X 10_15_7",
    "Macintosh; Intel Mac OS X 13_4_1",
    "Macintosh; Intel Mac OS X 14_0_1",
    "X11; Linux x86_64",
];

const VARIANTS_PER_OS: usize = 12;

const VIEWPORTS: &[Viewport] = &[
    Viewport { width: 1920, height: 1080 },
    Viewport { width: 1536, height: 864 },
    Viewport { width: 1440, height: 900 },
    Viewport { width: 1366, height: 768 },
    Viewport { width: 1280, height: 720 },
    Viewport { width: 2560, height: 1440 },
];

const LOCALES: &[&str] = &["en-US", "en-GB", "de-DE", "fr-FR", "es-ES", "it-IT", "nl-NL"];

const DOCUMENT_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub profile_id: String,
    pub user_agent: String,
    pub viewport: Viewport,
    pub locale: String,
    /// Browser headers in the order they should go on the wire.
    pub headers: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct FingerprintGenerator {
    user_agents: Vec<String>,
    fallback_cursor: AtomicUsize,
}

impl Default for FingerprintGenerator {
    fn default() -> Self {
        Self::with_user_agents(generate_user_agents())
    }
}

impl FingerprintGenerator {
    /// Uses `user_agents` as the pool. An empty pool serves the fallback list.
    pub fn with_user_agents(user_agents: Vec<String>) -> Self {
        Self {
            user_agents,
            fallback_cursor: AtomicUsize::new(0),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.user_agents.len()
    }

    pub fn generate(&self, identity: &EgressIdentity) -> Fingerprint {
        let mut rng = rand::rng();

        let user_agent = match identity.user_agent() {
            Some(pinned) => pinned.to_owned(),
            None => self
                .user_agents
                .choose(&mut rng)
                .cloned()
                .unwrap_or_else(|| self.fallback_user_agent()),
        };
        let viewport = VIEWPORTS
            .choose(&mut rng)
            .copied()
            .unwrap_or(Viewport {
                width: 1920,
                height: 1080,
            });
        let locale = LOCALES.choose(&mut rng).copied().unwrap_or("en-US").to_owned();

        let mut headers = vec![
            ("Accept".to_owned(), DOCUMENT_ACCEPT.to_owned()),
            ("Accept-Language".to_owned(), accept_language(&locale)),
            ("Upgrade-Insecure-Requests".to_owned(), "1".to_owned()),
            ("Sec-Fetch-Dest".to_owned(), "document".to_owned()),
            ("Sec-Fetch-Mode".to_owned(), "navigate".to_owned()),
            ("Sec-Fetch-Site".to_owned(), "none".to_owned()),
        ];
        headers.shuffle(&mut rng);

        let profile_id = format!(
            "{}-{:08x}",
            identity.profile().unwrap_or("fp"),
            rng.random::<u32>()
        );

        Fingerprint {
            profile_id,
            user_agent,
            viewport,
            locale,
            headers,
        }
    }

    fn fallback_user_agent(&self) -> String {
        let turn = self.fallback_cursor.fetch_add(1, Ordering::Relaxed);
        FALLBACK_USER_AGENTS[turn % FALLBACK_USER_AGENTS.len()].to_owned()
    }
}

fn accept_language(locale: &str) -> String {
    match locale.split_once('-') {
        Some((language, _)) => format!("{locale},{language};q=0.9"),
        None => locale.to_owned(),
    }
}

/// Builds a pool of plausible desktop user agents across Chrome, Edge and Firefox.
pub fn generate_user_agents() -> Vec<String> {
    let mut rng = rand::rng();
    let mut agents = Vec::with_capacity(OS_TOKENS.len() * VARIANTS_PER_OS);

    for os in OS_TOKENS {
        for _ in 0..VARIANTS_PER_OS {
            let agent = match rng.random_range(0..3) {
                0 => format!(
                    "Mozilla/5.0 ({os}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{}.0.{}.0 Safari/537.36",
                    rng.random_range(110..=128),
                    rng.random_range(0..=6499),
                ),
                1 => {
                    let chrome = rng.random_range(110..=128);
                    format!(
                        "Mozilla/5.0 ({os}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{chrome}.0.{}.0 Safari/537.36 Edg/{chrome}.0.{}.0",
                        rng.random_range(0..=6499),
                        rng.random_range(0..=2999),
                    )
                }
                _ => {
                    let major = rng.random_range(110..=128);
                    format!("Mozilla/5.0 ({os}; rv:{major}.0) Gecko/20100101 Firefox/{major}.0")
                }
            };
            agents.push(agent);
        }
    }

    agents
}
