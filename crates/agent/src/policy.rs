//! Policy gate for computer-use actions.
//!
//! Every [`ComputerCall`] is evaluated before execution. The decision is
//! one of `allow`, `require_ack` (suspend the run for an operator), or
//! `block` (end the run). Blocks come from the domain allow/block lists,
//! payment and login URL heuristics, and critical-point actions;
//! acknowledgements come from credential-typing heuristics and the
//! configured approval mode.

use serde::Serialize;

use af_domain::computer::{CheckSeverity, ComputerCall, PendingSafetyCheck};
use af_domain::config::{ApprovalMode, ComputerUseConfig};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decision
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    RequireAck,
    Block,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyDecision {
    pub decision: Decision,
    pub checks: Vec<PendingSafetyCheck>,
    pub reason: Option<String>,
}

impl PolicyDecision {
    fn allow(checks: Vec<PendingSafetyCheck>) -> Self {
        Self {
            decision: Decision::Allow,
            checks,
            reason: None,
        }
    }

    fn block(checks: Vec<PendingSafetyCheck>, reason: &str) -> Self {
        Self {
            decision: Decision::Block,
            checks,
            reason: Some(reason.to_string()),
        }
    }

    fn require_ack(checks: Vec<PendingSafetyCheck>, reason: &str) -> Self {
        Self {
            decision: Decision::RequireAck,
            checks,
            reason: Some(reason.to_string()),
        }
    }

    /// Timeline/event payload form.
    pub fn to_item(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "policy_decision",
            "decision": self.decision,
            "reason": self.reason.clone().unwrap_or_default(),
            "checks": self.checks,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// URL / domain matching
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const ALLOWED_SCHEMES: &[&str] = &["http", "https"];
const SAFE_SCHEMES: &[&str] = &["about", "data", "file", "chrome", "blob"];

fn url_scheme(url: &str) -> Option<&str> {
    url.split_once(':').map(|(scheme, _)| scheme)
}

/// Host portion of an http(s) URL: strip scheme, userinfo, port and path.
fn url_host(url: &str) -> Option<String> {
    let rest = url.split_once("://")?.1;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority.rsplit('@').next()?;
    let host = host.split(':').next()?;
    let cleaned = host.trim().to_ascii_lowercase();
    (!cleaned.is_empty()).then_some(cleaned)
}

fn normalize_domains(domains: &[String]) -> Vec<String> {
    domains
        .iter()
        .map(|d| d.trim().to_ascii_lowercase().trim_start_matches('.').to_string())
        .filter(|d| !d.is_empty())
        .collect()
}

fn domain_matches(hostname: &str, domain: &str) -> bool {
    if hostname.is_empty() || domain.is_empty() {
        return false;
    }
    hostname == domain || hostname.ends_with(&format!(".{domain}"))
}

pub fn is_domain_allowed(url: &str, config: &ComputerUseConfig) -> bool {
    let scheme = url_scheme(url).unwrap_or("").to_ascii_lowercase();
    if SAFE_SCHEMES.contains(&scheme.as_str()) {
        return true;
    }
    if !ALLOWED_SCHEMES.contains(&scheme.as_str()) {
        return !config.default_deny;
    }

    let Some(hostname) = url_host(url) else {
        return !config.default_deny;
    };

    for domain in normalize_domains(&config.blocked_domains) {
        if domain_matches(&hostname, &domain) {
            return false;
        }
    }

    let allowed = normalize_domains(&config.allowed_domains);
    if allowed.is_empty() {
        return !config.default_deny;
    }
    if allowed.iter().any(|d| d == "*") {
        return true;
    }
    allowed.iter().any(|d| domain_matches(&hostname, d))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Heuristics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn looks_like_credential(text: &str) -> bool {
    let lowered = text.to_lowercase();
    if lowered.contains("password") || lowered.contains("passwd") {
        return true;
    }
    if lowered.contains("api") && lowered.contains("key") {
        return true;
    }
    if lowered.contains("secret") || lowered.contains("token") {
        return true;
    }
    if text.len() >= 20 && text.chars().any(|c| c.is_ascii_digit()) {
        return true;
    }
    if text.contains('@') && text.contains('.') && text.len() >= 6 {
        return true;
    }
    false
}

fn contains_hint(text: &str, keywords: &[&str]) -> bool {
    let lowered = text.to_lowercase();
    keywords.iter().any(|k| lowered.contains(k))
}

fn detect_prompt_injection(summary: Option<&str>) -> bool {
    let Some(summary) = summary else { return false };
    contains_hint(
        summary,
        &[
            "ignore previous",
            "disregard instructions",
            "system prompt",
            "prompt injection",
        ],
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Evaluation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn evaluate_policy(call: &ComputerCall, config: &ComputerUseConfig) -> PolicyDecision {
    let mut checks = call.pending_safety_checks.clone();
    let action = &call.action;

    if let Some(url) = action.url() {
        if !url.is_empty() && !is_domain_allowed(url, config) {
            checks.push(PendingSafetyCheck::new(
                "sc_domain",
                "external_domain",
                CheckSeverity::High,
                "Domain is not in allowlist",
            ));
        }
        if contains_hint(url, &["login", "signin", "auth", "oauth"]) {
            checks.push(PendingSafetyCheck::new(
                "sc_auth",
                "sensitive_action",
                CheckSeverity::High,
                "Login/auth flow detected",
            ));
        }
        if contains_hint(url, &["checkout", "payment", "billing", "card", "purchase"]) {
            checks.push(PendingSafetyCheck::new(
                "sc_payment",
                "payment",
                CheckSeverity::High,
                "Payment flow detected",
            ));
        }
    }

    if let Some(text) = action.typed_text() {
        if looks_like_credential(text) {
            checks.push(PendingSafetyCheck::new(
                "sc_cred",
                "credentials",
                CheckSeverity::High,
                "Typed text resembles credentials",
            ));
        }
    }

    if call.meta.critical_point {
        checks.push(PendingSafetyCheck::new(
            "sc_irreversible",
            "irreversible",
            CheckSeverity::High,
            "Action marked as critical/irreversible",
        ));
    }

    if config.prompt_injection_detection
        && detect_prompt_injection(call.meta.reasoning_summary.as_deref())
    {
        checks.push(PendingSafetyCheck::new(
            "sc_injection",
            "prompt_injection",
            CheckSeverity::Medium,
            "Potential prompt injection signal",
        ));
    }

    for check in &checks {
        match check.category.as_str() {
            "external_domain" => return PolicyDecision::block(checks.clone(), "domain_blocked"),
            "payment" if !config.allow_payments => {
                return PolicyDecision::block(checks.clone(), "payments_blocked")
            }
            "sensitive_action" if !config.allow_login => {
                return PolicyDecision::block(checks.clone(), "login_blocked")
            }
            "irreversible" if !config.allow_irreversible => {
                return PolicyDecision::block(checks.clone(), "irreversible_blocked")
            }
            _ => {}
        }
    }

    if checks.iter().any(|c| c.category == "credentials") && !config.allow_credentials {
        return PolicyDecision::require_ack(checks, "credentials_require_approval");
    }

    if action.kind() == "terminate" {
        return PolicyDecision::allow(checks);
    }

    match config.approval_mode {
        ApprovalMode::Always => PolicyDecision::require_ack(checks, "approval_always"),
        ApprovalMode::OnRisk => {
            if checks.iter().any(|c| c.severity >= CheckSeverity::Medium) {
                return PolicyDecision::require_ack(checks, "risk_requires_approval");
            }
            if call.meta.critical_point {
                return PolicyDecision::require_ack(checks, "critical_point_requires_approval");
            }
            PolicyDecision::allow(checks)
        }
        ApprovalMode::Auto => PolicyDecision::allow(checks),
    }
}
