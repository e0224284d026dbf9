//! CAPTCHA detection (classification only, never solving).
//!
//! Stateless pattern classifier over known CAPTCHA DOM signatures. The
//! orchestrator uses it to turn a blocked fallback response into a typed
//! [`crate::error::FetchError::Captcha`].

use std::collections::HashMap;

use scraper::{Html, Selector};
use serde::Serialize;

/// CAPTCHA families we classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaKind {
    Recaptcha,
    Hcaptcha,
    Custom,
}

/// A detected challenge.
#[derive(Debug, Clone, Serialize)]
pub struct CaptchaChallenge {
    pub kind: CaptchaKind,
    /// reCAPTCHA version when it can be told apart ("v2"/"v3").
    pub version: Option<String>,
    /// Extra signals: sitekey, matched selector, form action.
    pub metadata: HashMap<String, String>,
}

/// Stateless DOM classifier. Selectors are parsed once at construction.
pub struct CaptchaDetector {
    recaptcha_widget: Selector,
    recaptcha_script: Selector,
    hcaptcha_widget: Selector,
    hcaptcha_script: Selector,
    scripts: Selector,
    captcha_forms: Selector,
    captcha_inputs: Selector,
}

impl CaptchaDetector {
    pub fn new() -> Self {
        // Static selector strings; parsing cannot fail.
        Self {
            recaptcha_widget: Selector::parse(".g-recaptcha, [data-sitekey].g-recaptcha")
                .expect("valid selector"),
            recaptcha_script: Selector::parse(
                "script[src*=\"recaptcha/api.js\"], script[src*=\"recaptcha/enterprise.js\"]",
            )
            .expect("valid selector"),
            hcaptcha_widget: Selector::parse(".h-captcha").expect("valid selector"),
            hcaptcha_script: Selector::parse("script[src*=\"hcaptcha.com\"]")
                .expect("valid selector"),
            scripts: Selector::parse("script").expect("valid selector"),
            captcha_forms: Selector::parse(
                "form[id*=\"captcha\"], form[class*=\"captcha\"], form[action*=\"captcha\"]",
            )
            .expect("valid selector"),
            captcha_inputs: Selector::parse("input[name*=\"captcha\"], img[src*=\"captcha\"]")
                .expect("valid selector"),
        }
    }

    /// Classify HTML content. Returns `None` for ordinary pages.
    pub fn detect(&self, html: &str) -> Option<CaptchaChallenge> {
        let document = Html::parse_document(html);

        // reCAPTCHA: explicit widget div, loader script, or v3 execute call.
        if let Some(widget) = document.select(&self.recaptcha_widget).next() {
            let mut metadata = HashMap::new();
            if let Some(sitekey) = widget.value().attr("data-sitekey") {
                metadata.insert("sitekey".to_string(), sitekey.to_string());
            }
            return Some(CaptchaChallenge {
                kind: CaptchaKind::Recaptcha,
                version: Some("v2".to_string()),
                metadata,
            });
        }
        if let Some(script) = document.select(&self.recaptcha_script).next() {
            let src = script.value().attr("src").unwrap_or_default();
            let version = if src.contains("render=") { "v3" } else { "v2" };
            let mut metadata = HashMap::new();
            metadata.insert("script_src".to_string(), src.to_string());
            return Some(CaptchaChallenge {
                kind: CaptchaKind::Recaptcha,
                version: Some(version.to_string()),
                metadata,
            });
        }
        // Inline v3 invocation without a recognizable loader src.
        for script in document.select(&self.scripts) {
            let text: String = script.text().collect();
            if text.contains("grecaptcha.execute") {
                return Some(CaptchaChallenge {
                    kind: CaptchaKind::Recaptcha,
                    version: Some("v3".to_string()),
                    metadata: HashMap::new(),
                });
            }
        }

        // hCaptcha.
        if let Some(widget) = document.select(&self.hcaptcha_widget).next() {
            let mut metadata = HashMap::new();
            if let Some(sitekey) = widget.value().attr("data-sitekey") {
                metadata.insert("sitekey".to_string(), sitekey.to_string());
            }
            return Some(CaptchaChallenge {
                kind: CaptchaKind::Hcaptcha,
                version: None,
                metadata,
            });
        }
        if document.select(&self.hcaptcha_script).next().is_some() {
            return Some(CaptchaChallenge {
                kind: CaptchaKind::Hcaptcha,
                version: None,
                metadata: HashMap::new(),
            });
        }

        // Generic custom challenge forms.
        if let Some(form) = document.select(&self.captcha_forms).next() {
            let mut metadata = HashMap::new();
            if let Some(action) = form.value().attr("action") {
                metadata.insert("form_action".to_string(), action.to_string());
            }
            return Some(CaptchaChallenge {
                kind: CaptchaKind::Custom,
                version: None,
                metadata,
            });
        }
        if document.select(&self.captcha_inputs).next().is_some() {
            return Some(CaptchaChallenge {
                kind: CaptchaKind::Custom,
                version: None,
                metadata: HashMap::new(),
            });
        }

        None
    }
}

impl Default for CaptchaDetector {
    fn default() -> Self {
        Self::new()
    }
}
