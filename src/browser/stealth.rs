//! Process-level stealth defaults for the portal session.
//!
//! The portal runs commodity bot detection; hiding the automation fingerprint
//! keeps CAPTCHA churn down. Flag set and JS shims follow the usual
//! Chromium-automation hardening: `AutomationControlled` off at the flag
//! level, `navigator.webdriver`/plugins/languages patched before any page
//! script runs.

use rand::seq::IndexedRandom;

const DESKTOP_USER_AGENTS: &[&str] = &[
    // Chrome 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 132 – macOS
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 131 – Linux
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Edge 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36 Edg/132.0.0.0",
];

/// Returns a randomly-chosen realistic desktop User-Agent string.
pub fn random_user_agent() -> &'static str {
    let mut rng = rand::rng();
    DESKTOP_USER_AGENTS
        .choose(&mut rng)
        .copied()
        .unwrap_or(DESKTOP_USER_AGENTS[0])
}

/// Chromium flags for an isolated, stealthy, CI-safe headless session.
///
/// Isolation flags mirror what many-worker deployments need: no shared
/// caches, no background networking, no crash reporter writing outside the
/// per-worker crash dir.
pub fn stealth_args() -> Vec<&'static str> {
    vec![
        "--disable-gpu",
        "--no-sandbox", // often required in CI / restricted environments
        "--disable-setuid-sandbox",
        "--disable-dev-shm-usage", // avoids /dev/shm OOM in constrained environments
        "--disable-extensions",
        "--disable-background-networking",
        "--disable-background-timer-throttling",
        "--disable-backgrounding-occluded-windows",
        "--disable-renderer-backgrounding",
        "--disable-sync",
        "--disable-translate",
        "--disable-crash-reporter",
        "--disable-breakpad",
        "--disable-hang-monitor",
        "--disable-prompt-on-repost",
        "--disable-domain-reliability",
        "--disable-client-side-phishing-detection",
        "--disable-component-extensions-with-background-pages",
        "--disable-ipc-flooding-protection",
        "--no-first-run",
        "--no-default-browser-check",
        "--no-default-apps",
        "--hide-scrollbars",
        "--mute-audio",
        // Stealth: suppress CDP automation fingerprint
        "--disable-blink-features=AutomationControlled",
    ]
}

/// JS injected before every document load to patch the obvious automation
/// tells left even with the flag-level hardening.
pub fn stealth_script() -> &'static str {
    r#"
Object.defineProperty(navigator, 'webdriver', {get: () => undefined});
Object.defineProperty(navigator, 'plugins', {get: () => [1, 2, 3, 4, 5]});
Object.defineProperty(navigator, 'languages', {get: () => ['en-US', 'en']});
window.chrome = window.chrome || { runtime: {} };
"#
}
