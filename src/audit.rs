//! Structured security audit trail.
//!
//! Every security-relevant decision emits a [`SecurityEvent`]: both outcomes
//! of authentication, lockouts, token lifecycle changes, key rotation, role
//! changes and store degradation. Events are redacted before they leave this
//! module; the precise failure reason lives here and only here, while clients
//! see the collapsed message from [`crate::errors::AuthError::client_message`].
//!
//! Events go to the `security_audit` tracing target and into a bounded
//! in-process ring buffer that tests and operators can inspect.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::user::UserId;

const AUDIT_RING_CAPACITY: usize = 1000;

static IPV4_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.\d{1,3}$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecuritySeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    AuthSuccess,
    AuthFailure,
    AccountLockout,
    UserCreated,
    UserDeactivated,
    TokenIssued,
    TokenRefreshed,
    TokenReuse,
    TokenRevoked,
    KeyRotation,
    RoleAssigned,
    RoleRemoved,
    PermissionDenied,
    StoreDegraded,
}

/// One audit record. PII-bearing fields are redacted by the builders, so a
/// fully-constructed event is always safe to serialize into logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: SecurityEventType,
    pub severity: SecuritySeverity,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl SecurityEvent {
    pub fn new(
        event_type: SecurityEventType,
        severity: SecuritySeverity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            severity,
            description: description.into(),
            user_id: None,
            email: None,
            client_ip: None,
            user_agent: None,
            detail: None,
        }
    }

    pub fn with_user(mut self, id: &UserId) -> Self {
        self.user_id = Some(*id);
        self
    }

    /// Attaches the email in redacted form.
    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(redact_email(email));
        self
    }

    /// Attaches the client address in truncated form.
    pub fn with_client_ip(mut self, ip: &str) -> Self {
        self.client_ip = Some(redact_ip(ip));
        self
    }

    /// Attaches the user agent, sanitized against log injection.
    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = Some(sanitize_user_agent(user_agent));
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Masks the local part of an email, keeping its first character and the full
/// domain so operators can still group events by tenant.
pub fn redact_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
            let head: String = local.chars().take(1).collect();
            format!("{head}***@{domain}")
        }
        _ => "***".to_string(),
    }
}

/// Truncates an IP address: last IPv4 octet dropped, IPv6 reduced to its
/// leading segment.
pub fn redact_ip(ip: &str) -> String {
    if let Some(caps) = IPV4_RE.captures(ip) {
        return format!("{}.{}.{}.x", &caps[1], &caps[2], &caps[3]);
    }
    if ip.contains(':') {
        let head = ip.split(':').next().unwrap_or_default();
        return format!("{head}::x");
    }
    "***".to_string()
}

const MAX_USER_AGENT_LEN: usize = 256;

/// Drops control characters and bounds the length, so a hostile User-Agent
/// header cannot split or flood log lines.
pub fn sanitize_user_agent(user_agent: &str) -> String {
    user_agent
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_USER_AGENT_LEN)
        .collect()
}

/// Cheap-to-clone audit sink. Emits to tracing and retains the most recent
/// events in memory.
#[derive(Debug, Clone, Default)]
pub struct AuditLogger {
    recent: Arc<Mutex<VecDeque<SecurityEvent>>>,
}

impl AuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an event. Never fails and never blocks on I/O; audit problems
    /// must not take the auth path down with them.
    pub fn record(&self, event: SecurityEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => match event.severity {
                SecuritySeverity::Critical => {
                    error!(
                        target: "security_audit",
                        event_id = %event.event_id,
                        event_type = ?event.event_type,
                        severity = ?event.severity,
                        user_id = ?event.user_id,
                        "SECURITY_EVENT: {}",
                        json
                    );
                }
                SecuritySeverity::Warning => {
                    warn!(
                        target: "security_audit",
                        event_id = %event.event_id,
                        event_type = ?event.event_type,
                        severity = ?event.severity,
                        user_id = ?event.user_id,
                        "SECURITY_EVENT: {}",
                        json
                    );
                }
                SecuritySeverity::Info => {
                    info!(
                        target: "security_audit",
                        event_id = %event.event_id,
                        event_type = ?event.event_type,
                        severity = ?event.severity,
                        user_id = ?event.user_id,
                        "SECURITY_EVENT: {}",
                        json
                    );
                }
            },
            Err(err) => {
                warn!(target: "security_audit", "failed to serialize audit event: {err}");
            }
        }

        if let Ok(mut recent) = self.recent.lock() {
            recent.push_back(event);
            while recent.len() > AUDIT_RING_CAPACITY {
                recent.pop_front();
            }
        }
    }

    /// Snapshot of the retained events, oldest first.
    pub fn recent(&self) -> Vec<SecurityEvent> {
        self.recent
            .lock()
            .map(|recent| recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Retained events of one type, oldest first.
    pub fn recent_of(&self, event_type: SecurityEventType) -> Vec<SecurityEvent> {
        self.recent()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn email_redaction_keeps_first_char_and_domain() {
        assert_eq!(redact_email("alice@example.com"), "a***@example.com");
        assert_eq!(redact_email("a@x.com"), "a***@x.com");
        assert_eq!(redact_email("not-an-email"), "***");
        assert_eq!(redact_email("@example.com"), "***");
    }

    #[test]
    fn ip_redaction_truncates_v4_and_v6() {
        assert_eq!(redact_ip("192.168.10.42"), "192.168.10.x");
        assert_eq!(redact_ip("2001:db8::1"), "2001::x");
        assert_eq!(redact_ip("localhost"), "***");
    }

    #[test]
    fn builders_redact_pii_at_construction() {
        let id = UserId::new();
        let event = SecurityEvent::new(
            SecurityEventType::AuthFailure,
            SecuritySeverity::Warning,
            "invalid password",
        )
        .with_user(&id)
        .with_email("bob@example.com")
        .with_client_ip("10.0.0.7")
        .with_user_agent("curl/8.4.0")
        .with_detail(json!({"attempt": 3}));

        assert_eq!(event.user_id, Some(id));
        assert_eq!(event.email.as_deref(), Some("b***@example.com"));
        assert_eq!(event.client_ip.as_deref(), Some("10.0.0.x"));
        assert_eq!(event.user_agent.as_deref(), Some("curl/8.4.0"));
        assert_eq!(event.detail, Some(json!({"attempt": 3})));
    }

    #[test]
    fn user_agent_sanitization_strips_control_chars_and_bounds_length() {
        assert_eq!(
            sanitize_user_agent("Mozilla/5.0\r\nInjected: line"),
            "Mozilla/5.0Injected: line"
        );
        let long = "a".repeat(500);
        assert_eq!(sanitize_user_agent(&long).len(), 256);
    }

    #[test]
    fn logger_retains_events_and_filters_by_type() {
        let audit = AuditLogger::new();
        audit.record(SecurityEvent::new(
            SecurityEventType::AuthSuccess,
            SecuritySeverity::Info,
            "login",
        ));
        audit.record(SecurityEvent::new(
            SecurityEventType::TokenReuse,
            SecuritySeverity::Critical,
            "replayed refresh token",
        ));

        assert_eq!(audit.recent().len(), 2);
        let reuse = audit.recent_of(SecurityEventType::TokenReuse);
        assert_eq!(reuse.len(), 1);
        assert_eq!(reuse[0].severity, SecuritySeverity::Critical);
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let audit = AuditLogger::new();
        for i in 0..AUDIT_RING_CAPACITY + 50 {
            audit.record(SecurityEvent::new(
                SecurityEventType::TokenIssued,
                SecuritySeverity::Info,
                format!("event {i}"),
            ));
        }
        let recent = audit.recent();
        assert_eq!(recent.len(), AUDIT_RING_CAPACITY);
        assert_eq!(recent[0].description, "event 50");
    }
}
